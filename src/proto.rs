//! LDAP operations and the LDAPMessage envelope, expressed as BER structures.
//!
//! Every operation is a BER value under its `[APPLICATION n]` tag with a fixed
//! field order; `to_ber`/`from_ber` are total and round-trip. The envelope is
//! a top-level SEQUENCE `[id, operation, controls?]`. There is no separate
//! framing on the wire: BER is self-delimiting, so message boundaries fall out
//! of decoding one complete envelope (see [`try_read_message`]).

use bytes::BytesMut;
use tracing::warn;

use crate::ber::{self, BerValue, Content, DecodeError, DecoderContext, Shape, Tag, UNIVERSAL};
use crate::error::{LdapError, ResultCode};
use crate::filter::Filter;

/// OID for the StartTLS extended operation (RFC 4511).
pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// OID for the Password Modify extended operation (RFC 3062).
pub const PASSWORD_MODIFY_OID: &str = "1.3.6.1.4.1.4203.1.11.1";

/// OID sent in the ExtendedResponse answering an unsupported operation
/// (the Notice of Disconnection OID, RFC 4511 section 4.4.1).
pub const UNSUPPORTED_OPERATION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// OID of the simple paged results control (RFC 2696).
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

// [APPLICATION n] tag numbers (RFC 4511 section 4.1.1).
const APP_BIND_REQUEST: u32 = 0;
const APP_BIND_RESPONSE: u32 = 1;
const APP_UNBIND_REQUEST: u32 = 2;
const APP_SEARCH_REQUEST: u32 = 3;
const APP_SEARCH_RESULT_ENTRY: u32 = 4;
const APP_SEARCH_RESULT_DONE: u32 = 5;
const APP_MODIFY_REQUEST: u32 = 6;
const APP_MODIFY_RESPONSE: u32 = 7;
const APP_ADD_REQUEST: u32 = 8;
const APP_ADD_RESPONSE: u32 = 9;
const APP_DEL_REQUEST: u32 = 10;
const APP_DEL_RESPONSE: u32 = 11;
const APP_MODIFY_DN_REQUEST: u32 = 12;
const APP_MODIFY_DN_RESPONSE: u32 = 13;
const APP_ABANDON_REQUEST: u32 = 16;
const APP_EXTENDED_REQUEST: u32 = 23;
const APP_EXTENDED_RESPONSE: u32 = 24;

/// Tags inside an operation: context `[0]`-`[11]` in primitive form are octet
/// strings (`[4]` is the dnAttributes BOOLEAN of an extensible match),
/// constructed forms nest. Children of nested values resolve here too
/// (`inherit` defaults to self); universal tags come from the fallback.
pub static LDAP_INNER: DecoderContext = DecoderContext::new(
    &[
        (Tag::context(0), Shape::Constructed),
        (Tag::context(1), Shape::Constructed),
        (Tag::context(2), Shape::Constructed),
        (Tag::context(3), Shape::Constructed),
        (Tag::context(4), Shape::Constructed),
        (Tag::context(5), Shape::Constructed),
        (Tag::context(6), Shape::Constructed),
        (Tag::context(7), Shape::Constructed),
        (Tag::context(8), Shape::Constructed),
        (Tag::context(9), Shape::Constructed),
        (Tag::context_primitive(0), Shape::OctetString),
        (Tag::context_primitive(1), Shape::OctetString),
        (Tag::context_primitive(2), Shape::OctetString),
        (Tag::context_primitive(3), Shape::OctetString),
        (Tag::context_primitive(4), Shape::Boolean),
        (Tag::context_primitive(5), Shape::OctetString),
        (Tag::context_primitive(6), Shape::OctetString),
        (Tag::context_primitive(7), Shape::OctetString),
        (Tag::context_primitive(8), Shape::OctetString),
        (Tag::context_primitive(10), Shape::OctetString),
        (Tag::context_primitive(11), Shape::OctetString),
    ],
    Some(&UNIVERSAL),
    None,
);

/// Tags valid directly inside the envelope: the operation's APPLICATION tag
/// and the `[0]`-tagged controls list. The same numeric `[0]` means an AND
/// filter deeper in; that reading lives in [`LDAP_INNER`], reached through
/// `inherit`. Application tags 14/15/19/25 decode structurally so an
/// unsupported operation still parses and can be answered, rather than
/// corrupting the stream.
pub static LDAP_MESSAGE: DecoderContext = DecoderContext::new(
    &[
        (Tag::application(APP_BIND_REQUEST), Shape::Constructed),
        (Tag::application(APP_BIND_RESPONSE), Shape::Constructed),
        (Tag::application_primitive(APP_UNBIND_REQUEST), Shape::Null),
        (Tag::application(APP_SEARCH_REQUEST), Shape::Constructed),
        (Tag::application(APP_SEARCH_RESULT_ENTRY), Shape::Constructed),
        (Tag::application(APP_SEARCH_RESULT_DONE), Shape::Constructed),
        (Tag::application(APP_MODIFY_REQUEST), Shape::Constructed),
        (Tag::application(APP_MODIFY_RESPONSE), Shape::Constructed),
        (Tag::application(APP_ADD_REQUEST), Shape::Constructed),
        (Tag::application(APP_ADD_RESPONSE), Shape::Constructed),
        (Tag::application_primitive(APP_DEL_REQUEST), Shape::OctetString),
        (Tag::application(APP_DEL_RESPONSE), Shape::Constructed),
        (Tag::application(APP_MODIFY_DN_REQUEST), Shape::Constructed),
        (Tag::application(APP_MODIFY_DN_RESPONSE), Shape::Constructed),
        (Tag::application(14), Shape::Constructed),
        (Tag::application(15), Shape::Constructed),
        (Tag::application_primitive(APP_ABANDON_REQUEST), Shape::Integer),
        (Tag::application(19), Shape::Constructed),
        (Tag::application(APP_EXTENDED_REQUEST), Shape::Constructed),
        (Tag::application(APP_EXTENDED_RESPONSE), Shape::Constructed),
        (Tag::application(25), Shape::Constructed),
        (Tag::context(0), Shape::Constructed),
    ],
    Some(&UNIVERSAL),
    Some(&LDAP_INNER),
);

/// Context for the envelope itself: the top-level SEQUENCE resolves through
/// the universal fallback, its children through [`LDAP_MESSAGE`].
pub static LDAP_ENVELOPE: DecoderContext =
    DecoderContext::new(&[], Some(&UNIVERSAL), Some(&LDAP_MESSAGE));

/// The result triple shared by every response operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
}

impl LdapResult {
    pub fn new(
        result_code: ResultCode,
        matched_dn: impl Into<String>,
        diagnostic_message: impl Into<String>,
    ) -> Self {
        LdapResult {
            result_code,
            matched_dn: matched_dn.into(),
            diagnostic_message: diagnostic_message.into(),
        }
    }

    pub fn success() -> Self {
        LdapResult::new(ResultCode::Success, "", "")
    }

    pub fn is_success(&self) -> bool {
        self.result_code.is_success()
    }

    /// As an error, for callers that propagate failure with `?`.
    pub fn into_error(self) -> LdapError {
        LdapError::Result {
            code: self.result_code,
            message: self.diagnostic_message,
        }
    }

    fn push_ber_fields(&self, fields: &mut Vec<BerValue>) {
        fields.push(BerValue::enumerated(self.result_code.code() as i64));
        fields.push(BerValue::string(&self.matched_dn));
        fields.push(BerValue::string(&self.diagnostic_message));
    }

    /// Response result for an internal failure: backend connection problems
    /// surface as `unavailable`, everything else keeps its code or maps to
    /// `other`.
    pub fn from_error(error: &LdapError) -> Self {
        match error {
            LdapError::Result { code, message } => LdapResult::new(*code, "", message.clone()),
            LdapError::NotConnected | LdapError::ConnectionLost | LdapError::Io(_) => {
                LdapResult::new(ResultCode::Unavailable, "", error.to_string())
            }
            other => LdapResult::new(ResultCode::Other, "", other.to_string()),
        }
    }

    /// First three children of a response; a trailing referral is ignored.
    fn from_children(children: &[BerValue]) -> Result<Self, LdapError> {
        let [code, matched, diagnostic, ..] = children else {
            return Err(shape("result must hold code, matchedDN and diagnostic"));
        };
        let code = code.as_integer().ok_or_else(|| shape("result code is not enumerated"))?;
        Ok(LdapResult {
            result_code: ResultCode::from_code(code as u32),
            matched_dn: string_field(matched, "matchedDN")?,
            diagnostic_message: string_field(diagnostic, "diagnosticMessage")?,
        })
    }
}

impl Default for LdapResult {
    fn default() -> Self {
        LdapResult::success()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(Vec<u8>),
    Sasl { mechanism: String, credentials: Vec<u8> },
}

impl BindRequest {
    pub fn simple(name: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        BindRequest {
            version: 3,
            name: name.into(),
            authentication: BindAuthentication::Simple(password.into()),
        }
    }

    /// An anonymous bind: empty name, empty password.
    pub fn anonymous() -> Self {
        BindRequest::simple("", Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i64> for SearchScope {
    type Error = LdapError;

    fn try_from(value: i64) -> Result<Self, LdapError> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            other => Err(LdapError::Protocol(format!("invalid search scope: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    /// A whole-subtree search with no limits, the common case.
    pub fn subtree(base_object: impl Into<String>, filter: Filter, attributes: Vec<String>) -> Self {
        SearchRequest {
            base_object: base_object.into(),
            scope: SearchScope::WholeSubtree,
            deref_aliases: 0,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes,
        }
    }
}

/// One attribute with its values, as used by entries, adds and modifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(attr_type: impl Into<String>, attr_values: Vec<Vec<u8>>) -> Self {
        Attribute { attr_type: attr_type.into(), attr_values }
    }

    /// Values from string slices, for the common textual case.
    pub fn strings(attr_type: impl Into<String>, values: &[&str]) -> Self {
        Attribute {
            attr_type: attr_type.into(),
            attr_values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        }
    }

    fn to_ber(&self) -> BerValue {
        BerValue::sequence(vec![
            BerValue::string(&self.attr_type),
            BerValue::set(self.attr_values.iter().map(|v| BerValue::octet_string(v.clone())).collect()),
        ])
    }

    fn from_ber(value: &BerValue) -> Result<Self, LdapError> {
        let children = value.children().ok_or_else(|| shape("attribute is not a sequence"))?;
        let [attr_type, values] = children else {
            return Err(shape("attribute must hold type and values"));
        };
        let attr_values = values
            .children()
            .ok_or_else(|| shape("attribute values are not a set"))?
            .iter()
            .map(|v| {
                v.as_octets()
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| shape("attribute value is not an octet string"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Attribute {
            attr_type: string_field(attr_type, "attribute type")?,
            attr_values,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

impl TryFrom<i64> for ModifyOperation {
    type Error = LdapError;

    fn try_from(value: i64) -> Result<Self, LdapError> {
        match value {
            0 => Ok(ModifyOperation::Add),
            1 => Ok(ModifyOperation::Delete),
            2 => Ok(ModifyOperation::Replace),
            other => Err(LdapError::Protocol(format!("invalid modify operation: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDNRequest {
    pub entry: String,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    pub fn plain(result: LdapResult) -> Self {
        ExtendedResponse { result, response_name: None, response_value: None }
    }
}

/// One LDAP protocol operation, at its `[APPLICATION n]` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDNRequest(ModifyDNRequest),
    ModifyDNResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
}

impl ProtocolOp {
    /// Whether a response is expected. False exactly for Unbind and Abandon:
    /// those never register a completion handler.
    pub fn needs_answer(&self) -> bool {
        !matches!(self, ProtocolOp::UnbindRequest | ProtocolOp::AbandonRequest(_))
    }

    /// Whether this is the terminal response of an exchange (one response per
    /// operation, or the Done after a stream of search entries).
    pub fn is_final_response(&self) -> bool {
        matches!(
            self,
            ProtocolOp::BindResponse(_)
                | ProtocolOp::SearchResultDone(_)
                | ProtocolOp::ModifyResponse(_)
                | ProtocolOp::AddResponse(_)
                | ProtocolOp::DelResponse(_)
                | ProtocolOp::ModifyDNResponse(_)
                | ProtocolOp::ExtendedResponse(_)
        )
    }

    /// The result triple, for response operations that carry one.
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(resp) => Some(&resp.result),
            ProtocolOp::SearchResultDone(result)
            | ProtocolOp::ModifyResponse(result)
            | ProtocolOp::AddResponse(result)
            | ProtocolOp::DelResponse(result)
            | ProtocolOp::ModifyDNResponse(result) => Some(result),
            ProtocolOp::ExtendedResponse(resp) => Some(&resp.result),
            _ => None,
        }
    }

    /// The `[APPLICATION n]` tag number of this operation.
    pub fn tag_number(&self) -> u32 {
        match self {
            ProtocolOp::BindRequest(_) => APP_BIND_REQUEST,
            ProtocolOp::BindResponse(_) => APP_BIND_RESPONSE,
            ProtocolOp::UnbindRequest => APP_UNBIND_REQUEST,
            ProtocolOp::SearchRequest(_) => APP_SEARCH_REQUEST,
            ProtocolOp::SearchResultEntry(_) => APP_SEARCH_RESULT_ENTRY,
            ProtocolOp::SearchResultDone(_) => APP_SEARCH_RESULT_DONE,
            ProtocolOp::ModifyRequest(_) => APP_MODIFY_REQUEST,
            ProtocolOp::ModifyResponse(_) => APP_MODIFY_RESPONSE,
            ProtocolOp::AddRequest(_) => APP_ADD_REQUEST,
            ProtocolOp::AddResponse(_) => APP_ADD_RESPONSE,
            ProtocolOp::DelRequest(_) => APP_DEL_REQUEST,
            ProtocolOp::DelResponse(_) => APP_DEL_RESPONSE,
            ProtocolOp::ModifyDNRequest(_) => APP_MODIFY_DN_REQUEST,
            ProtocolOp::ModifyDNResponse(_) => APP_MODIFY_DN_RESPONSE,
            ProtocolOp::AbandonRequest(_) => APP_ABANDON_REQUEST,
            ProtocolOp::ExtendedRequest(_) => APP_EXTENDED_REQUEST,
            ProtocolOp::ExtendedResponse(_) => APP_EXTENDED_RESPONSE,
        }
    }

    /// Human-readable operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "BindRequest",
            ProtocolOp::BindResponse(_) => "BindResponse",
            ProtocolOp::UnbindRequest => "UnbindRequest",
            ProtocolOp::SearchRequest(_) => "SearchRequest",
            ProtocolOp::SearchResultEntry(_) => "SearchResultEntry",
            ProtocolOp::SearchResultDone(_) => "SearchResultDone",
            ProtocolOp::ModifyRequest(_) => "ModifyRequest",
            ProtocolOp::ModifyResponse(_) => "ModifyResponse",
            ProtocolOp::AddRequest(_) => "AddRequest",
            ProtocolOp::AddResponse(_) => "AddResponse",
            ProtocolOp::DelRequest(_) => "DelRequest",
            ProtocolOp::DelResponse(_) => "DelResponse",
            ProtocolOp::ModifyDNRequest(_) => "ModifyDNRequest",
            ProtocolOp::ModifyDNResponse(_) => "ModifyDNResponse",
            ProtocolOp::AbandonRequest(_) => "AbandonRequest",
            ProtocolOp::ExtendedRequest(_) => "ExtendedRequest",
            ProtocolOp::ExtendedResponse(_) => "ExtendedResponse",
        }
    }

    pub fn to_ber(&self) -> BerValue {
        match self {
            ProtocolOp::BindRequest(req) => {
                let auth = match &req.authentication {
                    BindAuthentication::Simple(password) => BerValue::tagged(
                        Tag::context_primitive(0),
                        Content::OctetString(password.clone()),
                    ),
                    BindAuthentication::Sasl { mechanism, credentials } => {
                        let mut fields = vec![BerValue::string(mechanism)];
                        if !credentials.is_empty() {
                            fields.push(BerValue::octet_string(credentials.clone()));
                        }
                        BerValue::tagged(Tag::context(3), Content::Constructed(fields))
                    }
                };
                application(
                    APP_BIND_REQUEST,
                    vec![
                        BerValue::integer(req.version as i64),
                        BerValue::string(&req.name),
                        auth,
                    ],
                )
            }
            ProtocolOp::BindResponse(resp) => {
                let mut fields = Vec::new();
                resp.result.push_ber_fields(&mut fields);
                if let Some(creds) = &resp.server_sasl_creds {
                    fields.push(BerValue::tagged(
                        Tag::context_primitive(7),
                        Content::OctetString(creds.clone()),
                    ));
                }
                application(APP_BIND_RESPONSE, fields)
            }
            ProtocolOp::UnbindRequest => BerValue::tagged(
                Tag::application_primitive(APP_UNBIND_REQUEST),
                Content::Null,
            ),
            ProtocolOp::SearchRequest(req) => application(
                APP_SEARCH_REQUEST,
                vec![
                    BerValue::string(&req.base_object),
                    BerValue::enumerated(req.scope as i64),
                    BerValue::enumerated(req.deref_aliases as i64),
                    BerValue::integer(req.size_limit as i64),
                    BerValue::integer(req.time_limit as i64),
                    BerValue::boolean(req.types_only),
                    req.filter.to_ber(),
                    BerValue::sequence(req.attributes.iter().map(|a| BerValue::string(a)).collect()),
                ],
            ),
            ProtocolOp::SearchResultEntry(entry) => application(
                APP_SEARCH_RESULT_ENTRY,
                vec![
                    BerValue::string(&entry.object_name),
                    BerValue::sequence(entry.attributes.iter().map(Attribute::to_ber).collect()),
                ],
            ),
            ProtocolOp::SearchResultDone(result) => result_op(APP_SEARCH_RESULT_DONE, result),
            ProtocolOp::ModifyRequest(req) => application(
                APP_MODIFY_REQUEST,
                vec![
                    BerValue::string(&req.object),
                    BerValue::sequence(
                        req.changes
                            .iter()
                            .map(|change| {
                                BerValue::sequence(vec![
                                    BerValue::enumerated(change.operation as i64),
                                    change.modification.to_ber(),
                                ])
                            })
                            .collect(),
                    ),
                ],
            ),
            ProtocolOp::ModifyResponse(result) => result_op(APP_MODIFY_RESPONSE, result),
            ProtocolOp::AddRequest(req) => application(
                APP_ADD_REQUEST,
                vec![
                    BerValue::string(&req.entry),
                    BerValue::sequence(req.attributes.iter().map(Attribute::to_ber).collect()),
                ],
            ),
            ProtocolOp::AddResponse(result) => result_op(APP_ADD_RESPONSE, result),
            ProtocolOp::DelRequest(req) => BerValue::tagged(
                Tag::application_primitive(APP_DEL_REQUEST),
                Content::OctetString(req.entry.as_bytes().to_vec()),
            ),
            ProtocolOp::DelResponse(result) => result_op(APP_DEL_RESPONSE, result),
            ProtocolOp::ModifyDNRequest(req) => {
                let mut fields = vec![
                    BerValue::string(&req.entry),
                    BerValue::string(&req.newrdn),
                    BerValue::boolean(req.delete_old_rdn),
                ];
                if let Some(new_superior) = &req.new_superior {
                    fields.push(BerValue::tagged(
                        Tag::context_primitive(0),
                        Content::OctetString(new_superior.as_bytes().to_vec()),
                    ));
                }
                application(APP_MODIFY_DN_REQUEST, fields)
            }
            ProtocolOp::ModifyDNResponse(result) => result_op(APP_MODIFY_DN_RESPONSE, result),
            ProtocolOp::AbandonRequest(id) => BerValue::tagged(
                Tag::application_primitive(APP_ABANDON_REQUEST),
                Content::Integer(*id as i64),
            ),
            ProtocolOp::ExtendedRequest(req) => {
                let mut fields = vec![BerValue::tagged(
                    Tag::context_primitive(0),
                    Content::OctetString(req.request_name.as_bytes().to_vec()),
                )];
                if let Some(value) = &req.request_value {
                    fields.push(BerValue::tagged(
                        Tag::context_primitive(1),
                        Content::OctetString(value.clone()),
                    ));
                }
                application(APP_EXTENDED_REQUEST, fields)
            }
            ProtocolOp::ExtendedResponse(resp) => {
                let mut fields = Vec::new();
                resp.result.push_ber_fields(&mut fields);
                if let Some(name) = &resp.response_name {
                    fields.push(BerValue::tagged(
                        Tag::context_primitive(10),
                        Content::OctetString(name.as_bytes().to_vec()),
                    ));
                }
                if let Some(value) = &resp.response_value {
                    fields.push(BerValue::tagged(
                        Tag::context_primitive(11),
                        Content::OctetString(value.clone()),
                    ));
                }
                application(APP_EXTENDED_RESPONSE, fields)
            }
        }
    }

    pub fn from_ber(value: &BerValue) -> Result<Self, LdapError> {
        if value.tag.class != crate::ber::TagClass::Application {
            return Err(shape("operation tag is not an APPLICATION tag"));
        }
        match value.tag.number {
            APP_BIND_REQUEST => {
                let children = op_children(value)?;
                let [version, name, auth] = children else {
                    return Err(shape("bind request must hold version, name and auth"));
                };
                let authentication = match (auth.tag.number, &auth.content) {
                    (0, Content::OctetString(password)) => {
                        BindAuthentication::Simple(password.clone())
                    }
                    (3, Content::Constructed(fields)) => {
                        let mechanism = fields
                            .first()
                            .ok_or_else(|| shape("sasl credentials without mechanism"))?;
                        let credentials = fields
                            .get(1)
                            .and_then(|v| v.as_octets())
                            .map(<[u8]>::to_vec)
                            .unwrap_or_default();
                        BindAuthentication::Sasl {
                            mechanism: string_field(mechanism, "sasl mechanism")?,
                            credentials,
                        }
                    }
                    _ => return Err(shape("unsupported bind authentication choice")),
                };
                Ok(ProtocolOp::BindRequest(BindRequest {
                    version: integer_field(version, "bind version")? as i32,
                    name: string_field(name, "bind name")?,
                    authentication,
                }))
            }
            APP_BIND_RESPONSE => {
                let children = op_children(value)?;
                let result = LdapResult::from_children(children)?;
                let server_sasl_creds = children
                    .iter()
                    .skip(3)
                    .find(|v| v.tag == Tag::context_primitive(7))
                    .and_then(|v| v.as_octets())
                    .map(<[u8]>::to_vec);
                Ok(ProtocolOp::BindResponse(BindResponse { result, server_sasl_creds }))
            }
            APP_UNBIND_REQUEST => Ok(ProtocolOp::UnbindRequest),
            APP_SEARCH_REQUEST => {
                let children = op_children(value)?;
                let [base, scope, deref, size, time, types_only, filter, attributes] = children
                else {
                    return Err(shape("search request must hold eight fields"));
                };
                Ok(ProtocolOp::SearchRequest(SearchRequest {
                    base_object: string_field(base, "search base")?,
                    scope: SearchScope::try_from(integer_field(scope, "search scope")?)?,
                    deref_aliases: integer_field(deref, "derefAliases")? as i32,
                    size_limit: integer_field(size, "sizeLimit")? as i32,
                    time_limit: integer_field(time, "timeLimit")? as i32,
                    types_only: types_only
                        .as_bool()
                        .ok_or_else(|| shape("typesOnly is not a boolean"))?,
                    filter: Filter::from_ber(filter)?,
                    attributes: attributes
                        .children()
                        .ok_or_else(|| shape("attribute list is not a sequence"))?
                        .iter()
                        .map(|a| string_field(a, "requested attribute"))
                        .collect::<Result<Vec<_>, _>>()?,
                }))
            }
            APP_SEARCH_RESULT_ENTRY => {
                let children = op_children(value)?;
                let [object_name, attributes] = children else {
                    return Err(shape("search entry must hold name and attributes"));
                };
                Ok(ProtocolOp::SearchResultEntry(SearchResultEntry {
                    object_name: string_field(object_name, "entry name")?,
                    attributes: attributes
                        .children()
                        .ok_or_else(|| shape("entry attributes are not a sequence"))?
                        .iter()
                        .map(Attribute::from_ber)
                        .collect::<Result<Vec<_>, _>>()?,
                }))
            }
            APP_SEARCH_RESULT_DONE => {
                Ok(ProtocolOp::SearchResultDone(LdapResult::from_children(op_children(value)?)?))
            }
            APP_MODIFY_REQUEST => {
                let children = op_children(value)?;
                let [object, changes] = children else {
                    return Err(shape("modify request must hold object and changes"));
                };
                let changes = changes
                    .children()
                    .ok_or_else(|| shape("modify changes are not a sequence"))?
                    .iter()
                    .map(|change| {
                        let fields = change
                            .children()
                            .ok_or_else(|| shape("modify change is not a sequence"))?;
                        let [operation, modification] = fields else {
                            return Err(shape("modify change must hold operation and attribute"));
                        };
                        Ok(ModifyChange {
                            operation: ModifyOperation::try_from(integer_field(
                                operation,
                                "modify operation",
                            )?)?,
                            modification: Attribute::from_ber(modification)?,
                        })
                    })
                    .collect::<Result<Vec<_>, LdapError>>()?;
                Ok(ProtocolOp::ModifyRequest(ModifyRequest {
                    object: string_field(object, "modify object")?,
                    changes,
                }))
            }
            APP_MODIFY_RESPONSE => {
                Ok(ProtocolOp::ModifyResponse(LdapResult::from_children(op_children(value)?)?))
            }
            APP_ADD_REQUEST => {
                let children = op_children(value)?;
                let [entry, attributes] = children else {
                    return Err(shape("add request must hold entry and attributes"));
                };
                Ok(ProtocolOp::AddRequest(AddRequest {
                    entry: string_field(entry, "add entry")?,
                    attributes: attributes
                        .children()
                        .ok_or_else(|| shape("add attributes are not a sequence"))?
                        .iter()
                        .map(Attribute::from_ber)
                        .collect::<Result<Vec<_>, _>>()?,
                }))
            }
            APP_ADD_RESPONSE => {
                Ok(ProtocolOp::AddResponse(LdapResult::from_children(op_children(value)?)?))
            }
            APP_DEL_REQUEST => Ok(ProtocolOp::DelRequest(DelRequest {
                entry: string_field(value, "delete entry")?,
            })),
            APP_DEL_RESPONSE => {
                Ok(ProtocolOp::DelResponse(LdapResult::from_children(op_children(value)?)?))
            }
            APP_MODIFY_DN_REQUEST => {
                let children = op_children(value)?;
                let [entry, newrdn, delete_old_rdn, rest @ ..] = children else {
                    return Err(shape("modifyDN request must hold entry, newrdn and flag"));
                };
                let new_superior = match rest {
                    [] => None,
                    [superior] if superior.tag == Tag::context_primitive(0) => {
                        Some(string_field(superior, "newSuperior")?)
                    }
                    _ => return Err(shape("unexpected trailing fields in modifyDN request")),
                };
                Ok(ProtocolOp::ModifyDNRequest(ModifyDNRequest {
                    entry: string_field(entry, "modifyDN entry")?,
                    newrdn: string_field(newrdn, "newrdn")?,
                    delete_old_rdn: delete_old_rdn
                        .as_bool()
                        .ok_or_else(|| shape("deleteoldrdn is not a boolean"))?,
                    new_superior,
                }))
            }
            APP_MODIFY_DN_RESPONSE => {
                Ok(ProtocolOp::ModifyDNResponse(LdapResult::from_children(op_children(value)?)?))
            }
            APP_ABANDON_REQUEST => {
                let id = value
                    .as_integer()
                    .ok_or_else(|| shape("abandon request is not an integer"))?;
                Ok(ProtocolOp::AbandonRequest(id as i32))
            }
            APP_EXTENDED_REQUEST => {
                let children = op_children(value)?;
                let request_name = children
                    .iter()
                    .find(|v| v.tag == Tag::context_primitive(0))
                    .ok_or_else(|| shape("extended request without request name"))?;
                let request_value = children
                    .iter()
                    .find(|v| v.tag == Tag::context_primitive(1))
                    .and_then(|v| v.as_octets())
                    .map(<[u8]>::to_vec);
                Ok(ProtocolOp::ExtendedRequest(ExtendedRequest {
                    request_name: string_field(request_name, "extended request name")?,
                    request_value,
                }))
            }
            APP_EXTENDED_RESPONSE => {
                let children = op_children(value)?;
                let result = LdapResult::from_children(children)?;
                let response_name = children
                    .iter()
                    .find(|v| v.tag == Tag::context_primitive(10))
                    .map(|v| string_field(v, "extended response name"))
                    .transpose()?;
                let response_value = children
                    .iter()
                    .find(|v| v.tag == Tag::context_primitive(11))
                    .and_then(|v| v.as_octets())
                    .map(<[u8]>::to_vec);
                Ok(ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result,
                    response_name,
                    response_value,
                }))
            }
            other => Err(LdapError::Protocol(format!(
                "unsupported operation tag [APPLICATION {}]",
                other
            ))),
        }
    }
}

fn application(number: u32, children: Vec<BerValue>) -> BerValue {
    BerValue::tagged(Tag::application(number), Content::Constructed(children))
}

fn result_op(number: u32, result: &LdapResult) -> BerValue {
    let mut fields = Vec::new();
    result.push_ber_fields(&mut fields);
    application(number, fields)
}

fn op_children(value: &BerValue) -> Result<&[BerValue], LdapError> {
    value.children().ok_or_else(|| shape("operation is not constructed"))
}

fn string_field(value: &BerValue, what: &str) -> Result<String, LdapError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| LdapError::Protocol(format!("{} is not a UTF-8 string", what)))
}

fn integer_field(value: &BerValue, what: &str) -> Result<i64, LdapError> {
    value
        .as_integer()
        .ok_or_else(|| LdapError::Protocol(format!("{} is not an integer", what)))
}

fn shape(message: &str) -> LdapError {
    LdapError::Protocol(message.to_string())
}

/// An OID-identified extension attached to a request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub criticality: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(oid: impl Into<String>, criticality: bool, value: Option<Vec<u8>>) -> Self {
        Control { oid: oid.into(), criticality, value }
    }

    fn to_ber(&self) -> BerValue {
        let mut fields = vec![BerValue::string(&self.oid)];
        if self.criticality {
            // DEFAULT FALSE: only encoded when set.
            fields.push(BerValue::boolean(true));
        }
        if let Some(value) = &self.value {
            fields.push(BerValue::octet_string(value.clone()));
        }
        BerValue::sequence(fields)
    }

    fn from_ber(value: &BerValue) -> Result<Self, LdapError> {
        let children = value.children().ok_or_else(|| shape("control is not a sequence"))?;
        let oid = children
            .first()
            .map(|v| string_field(v, "control oid"))
            .transpose()?
            .ok_or_else(|| shape("control without oid"))?;
        let mut criticality = false;
        let mut control_value = None;
        for field in &children[1..] {
            match &field.content {
                Content::Boolean(critical) => criticality = *critical,
                Content::OctetString(bytes) => control_value = Some(bytes.clone()),
                _ => return Err(shape("unexpected field in control")),
            }
        }
        Ok(Control { oid, criticality, value: control_value })
    }
}

/// The LDAPMessage envelope: id, one operation, optional controls.
///
/// Id 0 marks an unsolicited notification; ids on requests are allocated by a
/// per-connection monotonic counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub id: i32,
    pub op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

impl LdapMessage {
    pub fn new(id: i32, op: ProtocolOp) -> Self {
        LdapMessage { id, op, controls: None }
    }

    pub fn with_controls(id: i32, op: ProtocolOp, controls: Vec<Control>) -> Self {
        LdapMessage { id, op, controls: Some(controls) }
    }

    pub fn to_ber(&self) -> BerValue {
        let mut children = vec![BerValue::integer(self.id as i64), self.op.to_ber()];
        if let Some(controls) = &self.controls {
            children.push(BerValue::tagged(
                Tag::context(0),
                Content::Constructed(controls.iter().map(Control::to_ber).collect()),
            ));
        }
        BerValue::sequence(children)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        ber::encode(&self.to_ber())
    }

    pub fn from_ber(value: &BerValue) -> Result<Self, LdapError> {
        let children = value
            .children()
            .ok_or_else(|| shape("message envelope is not a sequence"))?;
        let [id, op, rest @ ..] = children else {
            return Err(shape("message envelope must hold id and operation"));
        };
        let id = integer_field(id, "message id")?;
        if !(0..=i32::MAX as i64).contains(&id) {
            return Err(LdapError::Protocol(format!("message id {} out of range", id)));
        }
        let controls = match rest {
            [] => None,
            [controls] if controls.tag == Tag::context(0) => Some(
                controls
                    .children()
                    .ok_or_else(|| shape("controls are not constructed"))?
                    .iter()
                    .map(Control::from_ber)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            _ => return Err(shape("unexpected trailing fields in message envelope")),
        };
        Ok(LdapMessage { id: id as i32, op: ProtocolOp::from_ber(op)?, controls })
    }
}

/// A message taken off the stream, with the exact bytes it arrived as (the
/// proxy forwards those verbatim).
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message: LdapMessage,
    pub raw: Vec<u8>,
}

/// Result of trying to take one message off the front of a receive buffer.
#[derive(Debug)]
pub enum ParseOutcome {
    /// Not enough data yet; the buffer is untouched.
    Incomplete,
    /// One complete message was consumed.
    Message(ParsedMessage),
    /// The BER was complete and well-formed but the PDU shape was not; the
    /// bytes were consumed so the stream stays usable. `id` and `tag` are
    /// what could be salvaged for building an error response.
    Invalid {
        id: i32,
        tag: Option<u32>,
        error: LdapError,
    },
}

/// Try to decode one LDAPMessage from the front of `buf`.
///
/// Uses the insufficient-data signal from the BER layer to leave partial
/// messages buffered; a hard BER error (unknown top-level tag, indefinite
/// length) is returned as `Err` and means the stream is corrupt beyond this
/// point.
pub fn try_read_message(buf: &mut BytesMut) -> Result<ParseOutcome, LdapError> {
    let (value, used) = match ber::decode(&LDAP_ENVELOPE, buf) {
        Ok(None) => return Ok(ParseOutcome::Incomplete),
        Err(DecodeError::InsufficientData) => return Ok(ParseOutcome::Incomplete),
        Err(e) => return Err(e.into()),
        Ok(Some(decoded)) => decoded,
    };
    let raw = buf[..used].to_vec();
    let _ = buf.split_to(used);
    match LdapMessage::from_ber(&value) {
        Ok(message) => Ok(ParseOutcome::Message(ParsedMessage { message, raw })),
        Err(error) => {
            let (id, tag) = salvage_header(&value);
            warn!("discarding unparseable LDAP message (id {:?}): {}", id, error);
            Ok(ParseOutcome::Invalid { id: id.unwrap_or(0), tag, error })
        }
    }
}

/// Best-effort id and operation tag from a decoded envelope whose LDAP shape
/// was rejected, for addressing the error response.
fn salvage_header(value: &BerValue) -> (Option<i32>, Option<u32>) {
    let Some(children) = value.children() else {
        return (None, None);
    };
    let id = children.first().and_then(BerValue::as_integer).map(|id| id as i32);
    let tag = children.get(1).map(|op| op.tag.number);
    (id, tag)
}

/// The response operation matching a request tag, for error responses to
/// requests that could not be fully parsed. Unknown tags get an
/// ExtendedResponse.
pub fn error_response_for_tag(tag: Option<u32>, result: LdapResult) -> ProtocolOp {
    match tag {
        Some(APP_BIND_REQUEST) => ProtocolOp::BindResponse(BindResponse {
            result,
            server_sasl_creds: None,
        }),
        Some(APP_SEARCH_REQUEST) => ProtocolOp::SearchResultDone(result),
        Some(APP_MODIFY_REQUEST) => ProtocolOp::ModifyResponse(result),
        Some(APP_ADD_REQUEST) => ProtocolOp::AddResponse(result),
        Some(APP_DEL_REQUEST) => ProtocolOp::DelResponse(result),
        Some(APP_MODIFY_DN_REQUEST) => ProtocolOp::ModifyDNResponse(result),
        _ => ProtocolOp::ExtendedResponse(ExtendedResponse {
            result,
            response_name: Some(UNSUPPORTED_OPERATION_OID.to_string()),
            response_value: None,
        }),
    }
}

/// Payload of the Password Modify extended operation (RFC 3062): a nested
/// BER SEQUENCE of optional octet strings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PasswordModifyRequest {
    pub user_identity: Option<String>,
    pub old_passwd: Option<Vec<u8>>,
    pub new_passwd: Option<Vec<u8>>,
}

impl PasswordModifyRequest {
    pub fn to_value(&self) -> Vec<u8> {
        let mut fields = Vec::new();
        if let Some(user) = &self.user_identity {
            fields.push(BerValue::tagged(
                Tag::context_primitive(0),
                Content::OctetString(user.as_bytes().to_vec()),
            ));
        }
        if let Some(old) = &self.old_passwd {
            fields.push(BerValue::tagged(
                Tag::context_primitive(1),
                Content::OctetString(old.clone()),
            ));
        }
        if let Some(new) = &self.new_passwd {
            fields.push(BerValue::tagged(
                Tag::context_primitive(2),
                Content::OctetString(new.clone()),
            ));
        }
        ber::encode(&BerValue::sequence(fields))
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, LdapError> {
        let (value, _) = ber::decode(&LDAP_INNER, bytes)?
            .ok_or_else(|| shape("empty password modify payload"))?;
        let mut request = PasswordModifyRequest::default();
        for field in value
            .children()
            .ok_or_else(|| shape("password modify payload is not a sequence"))?
        {
            match field.tag.number {
                0 => request.user_identity = Some(string_field(field, "userIdentity")?),
                1 => {
                    request.old_passwd =
                        Some(field.as_octets().map(<[u8]>::to_vec).ok_or_else(|| {
                            shape("oldPasswd is not an octet string")
                        })?)
                }
                2 => {
                    request.new_passwd =
                        Some(field.as_octets().map(<[u8]>::to_vec).ok_or_else(|| {
                            shape("newPasswd is not an octet string")
                        })?)
                }
                _ => return Err(shape("unexpected field in password modify payload")),
            }
        }
        Ok(request)
    }
}

/// Value of the simple paged results control (RFC 2696): `SEQUENCE
/// { pageSize INTEGER, cookie OCTET STRING }`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PagedResultsValue {
    pub size: i32,
    pub cookie: Vec<u8>,
}

impl PagedResultsValue {
    pub fn to_value(&self) -> Vec<u8> {
        ber::encode(&BerValue::sequence(vec![
            BerValue::integer(self.size as i64),
            BerValue::octet_string(self.cookie.clone()),
        ]))
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, LdapError> {
        let (value, _) = ber::decode(&UNIVERSAL, bytes)?
            .ok_or_else(|| shape("empty paged results value"))?;
        let children = value
            .children()
            .ok_or_else(|| shape("paged results value is not a sequence"))?;
        let [size, cookie] = children else {
            return Err(shape("paged results value must hold size and cookie"));
        };
        Ok(PagedResultsValue {
            size: integer_field(size, "page size")? as i32,
            cookie: cookie
                .as_octets()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| shape("paged results cookie is not an octet string"))?,
        })
    }

    /// The control carrying this value.
    pub fn to_control(&self, criticality: bool) -> Control {
        Control::new(PAGED_RESULTS_OID, criticality, Some(self.to_value()))
    }
}
