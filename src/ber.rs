//! ASN.1 BER codec: tagged values, definite-length encoding, and tag-driven
//! decoding through chained decoder contexts.
//!
//! The same numeric tag means different things at different nesting depths
//! (context tag `[0]` is the controls list at the envelope level and an AND
//! filter inside a search request), so decoding is driven by a
//! [`DecoderContext`]: an immutable `{tag -> shape}` table with a `fallback`
//! link tried for unknown tags and an `inherit` link naming the context used
//! for a constructed value's children.
//!
//! Tag encoding follows X.690 8.1.2: bits 7-6 class, bit 5 constructed,
//! bits 4-0 tag number. Long-form tag numbers (0x1F) never occur in LDAP and
//! are rejected.

use thiserror::Error;

/// Tag class (identification octet bits 7-6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
    Universal,
    Application,
    Context,
    Private,
}

impl TagClass {
    fn bits(self) -> u8 {
        match self {
            TagClass::Universal => 0x00,
            TagClass::Application => 0x40,
            TagClass::Context => 0x80,
            TagClass::Private => 0xC0,
        }
    }
}

/// Universal tag numbers used by LDAP.
pub const TAG_BOOLEAN: u32 = 0x01;
pub const TAG_INTEGER: u32 = 0x02;
pub const TAG_OCTET_STRING: u32 = 0x04;
pub const TAG_NULL: u32 = 0x05;
pub const TAG_ENUMERATED: u32 = 0x0A;
pub const TAG_SEQUENCE: u32 = 0x10;
pub const TAG_SET: u32 = 0x11;

/// One BER identification octet, decomposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    pub class: TagClass,
    pub constructed: bool,
    pub number: u32,
}

impl Tag {
    pub const fn universal(number: u32) -> Self {
        Tag { class: TagClass::Universal, constructed: false, number }
    }

    pub const fn universal_constructed(number: u32) -> Self {
        Tag { class: TagClass::Universal, constructed: true, number }
    }

    pub const fn application(number: u32) -> Self {
        Tag { class: TagClass::Application, constructed: true, number }
    }

    pub const fn application_primitive(number: u32) -> Self {
        Tag { class: TagClass::Application, constructed: false, number }
    }

    pub const fn context(number: u32) -> Self {
        Tag { class: TagClass::Context, constructed: true, number }
    }

    pub const fn context_primitive(number: u32) -> Self {
        Tag { class: TagClass::Context, constructed: false, number }
    }

    /// The single identification octet. Only valid for tag numbers <= 30,
    /// which is all LDAP ever uses.
    pub fn octet(self) -> u8 {
        debug_assert!(self.number <= 30);
        self.class.bits() | if self.constructed { 0x20 } else { 0x00 } | (self.number as u8 & 0x1F)
    }

    fn from_octet(octet: u8) -> Self {
        let class = match octet & 0xC0 {
            0x00 => TagClass::Universal,
            0x40 => TagClass::Application,
            0x80 => TagClass::Context,
            _ => TagClass::Private,
        };
        Tag {
            class,
            constructed: octet & 0x20 != 0,
            number: (octet & 0x1F) as u32,
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let class = match self.class {
            TagClass::Universal => "universal",
            TagClass::Application => "application",
            TagClass::Context => "context",
            TagClass::Private => "private",
        };
        let form = if self.constructed { "constructed" } else { "primitive" };
        write!(f, "[{} {} {}]", class, self.number, form)
    }
}

/// Content of one tagged value. Enumerated values are `Integer` content under
/// the ENUMERATED tag; SEQUENCE and SET are `Constructed` under their tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Boolean(bool),
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    Constructed(Vec<BerValue>),
}

/// One decoded BER value: its tag plus interpreted content.
///
/// Invariant: `decode(encode(v)) == v` for every representable value, and
/// length encoding is always definite-form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerValue {
    pub tag: Tag,
    pub content: Content,
}

impl BerValue {
    pub fn boolean(value: bool) -> Self {
        BerValue { tag: Tag::universal(TAG_BOOLEAN), content: Content::Boolean(value) }
    }

    pub fn integer(value: i64) -> Self {
        BerValue { tag: Tag::universal(TAG_INTEGER), content: Content::Integer(value) }
    }

    pub fn enumerated(value: i64) -> Self {
        BerValue { tag: Tag::universal(TAG_ENUMERATED), content: Content::Integer(value) }
    }

    pub fn octet_string(value: impl Into<Vec<u8>>) -> Self {
        BerValue { tag: Tag::universal(TAG_OCTET_STRING), content: Content::OctetString(value.into()) }
    }

    pub fn string(value: &str) -> Self {
        Self::octet_string(value.as_bytes().to_vec())
    }

    pub fn null() -> Self {
        BerValue { tag: Tag::universal(TAG_NULL), content: Content::Null }
    }

    pub fn sequence(children: Vec<BerValue>) -> Self {
        BerValue {
            tag: Tag::universal_constructed(TAG_SEQUENCE),
            content: Content::Constructed(children),
        }
    }

    pub fn set(children: Vec<BerValue>) -> Self {
        BerValue {
            tag: Tag::universal_constructed(TAG_SET),
            content: Content::Constructed(children),
        }
    }

    /// A value with an overriding (application/context) tag.
    pub fn tagged(tag: Tag, content: Content) -> Self {
        BerValue { tag, content }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.content {
            Content::Boolean(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.content {
            Content::Integer(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_octets(&self) -> Option<&[u8]> {
        match &self.content {
            Content::OctetString(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_octets().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn children(&self) -> Option<&[BerValue]> {
        match &self.content {
            Content::Constructed(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_children(self) -> Option<Vec<BerValue>> {
        match self.content {
            Content::Constructed(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_octets(self) -> Option<Vec<u8>> {
        match self.content {
            Content::OctetString(v) => Some(v),
            _ => None,
        }
    }
}

/// Decode failures.
///
/// `InsufficientData` is the recoverable case: the buffer does not yet hold a
/// complete length-prefixed value. Decoding never consumes bytes on error, so
/// retrying after buffering more data is always safe. Everything else is
/// non-recoverable for that buffer position.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("need more data to decode a complete value")]
    InsufficientData,

    #[error("no decoder for tag {0}")]
    UnknownTag(Tag),

    #[error("indefinite lengths are not supported")]
    IndefiniteLength,

    #[error("length of {0} octets exceeds the supported maximum")]
    LengthTooLarge(usize),

    #[error("long-form tag numbers are not supported")]
    LongFormTag,

    #[error("malformed value: {0}")]
    Malformed(&'static str),
}

/// How to interpret the content octets of a tag the context resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Boolean,
    Integer,
    OctetString,
    Null,
    Constructed,
}

/// An immutable `{tag -> shape}` table with chaining links.
///
/// `lookup` consults the local entries and then follows `fallback`; children
/// of a constructed value are decoded with [`DecoderContext::inherit`].
/// Contexts are composed by reference into statics, never built at runtime.
pub struct DecoderContext {
    entries: &'static [(Tag, Shape)],
    fallback: Option<&'static DecoderContext>,
    inherit: Option<&'static DecoderContext>,
}

impl DecoderContext {
    pub const fn new(
        entries: &'static [(Tag, Shape)],
        fallback: Option<&'static DecoderContext>,
        inherit: Option<&'static DecoderContext>,
    ) -> Self {
        DecoderContext { entries, fallback, inherit }
    }

    /// Resolve a tag to the shape of its content, following the fallback
    /// chain. `None` means no context in the chain knows the tag.
    pub fn lookup(&self, tag: Tag) -> Option<Shape> {
        for (t, shape) in self.entries {
            if *t == tag {
                return Some(*shape);
            }
        }
        self.fallback.and_then(|f| f.lookup(tag))
    }

    /// The context used to decode a constructed value's children. Defaults to
    /// the context itself.
    pub fn inherit(&self) -> &DecoderContext {
        self.inherit.unwrap_or(self)
    }
}

/// Universal tags only. The root of every fallback chain.
pub static UNIVERSAL: DecoderContext = DecoderContext::new(
    &[
        (Tag::universal(TAG_BOOLEAN), Shape::Boolean),
        (Tag::universal(TAG_INTEGER), Shape::Integer),
        (Tag::universal(TAG_ENUMERATED), Shape::Integer),
        (Tag::universal(TAG_OCTET_STRING), Shape::OctetString),
        (Tag::universal(TAG_NULL), Shape::Null),
        (Tag::universal_constructed(TAG_SEQUENCE), Shape::Constructed),
        (Tag::universal_constructed(TAG_SET), Shape::Constructed),
    ],
    None,
    None,
);

/// Encode a value to bytes. Total and deterministic: identification octet,
/// definite length (short form <= 127, else length-of-length), then content
/// octets or the concatenated encodings of the children.
pub fn encode(value: &BerValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &BerValue, out: &mut Vec<u8>) {
    out.push(value.tag.octet());
    match &value.content {
        Content::Boolean(v) => {
            push_length(out, 1);
            out.push(if *v { 0xFF } else { 0x00 });
        }
        Content::Integer(v) => {
            let octets = integer_octets(*v);
            push_length(out, octets.len());
            out.extend_from_slice(&octets);
        }
        Content::OctetString(v) => {
            push_length(out, v.len());
            out.extend_from_slice(v);
        }
        Content::Null => push_length(out, 0),
        Content::Constructed(children) => {
            let mut inner = Vec::new();
            for child in children {
                encode_into(child, &mut inner);
            }
            push_length(out, inner.len());
            out.extend_from_slice(&inner);
        }
    }
}

fn push_length(out: &mut Vec<u8>, length: usize) {
    if length < 128 {
        out.push(length as u8);
    } else {
        let mut bytes = Vec::new();
        let mut len = length;
        while len > 0 {
            bytes.push((len & 0xFF) as u8);
            len >>= 8;
        }
        bytes.reverse();
        out.push(0x80 | bytes.len() as u8);
        out.extend_from_slice(&bytes);
    }
}

/// Minimal two's-complement content octets for an INTEGER.
fn integer_octets(value: i64) -> Vec<u8> {
    let mut bytes = value.to_be_bytes().to_vec();
    while bytes.len() > 1
        && ((bytes[0] == 0x00 && bytes[1] & 0x80 == 0)
            || (bytes[0] == 0xFF && bytes[1] & 0x80 != 0))
    {
        bytes.remove(0);
    }
    bytes
}

/// Decode one value from the front of `buf`.
///
/// Returns `Ok(None)` on an empty buffer, `Ok(Some((value, consumed)))` on
/// success, `Err(DecodeError::InsufficientData)` when the buffer holds only a
/// partial value. No bytes are consumed on any error path; the caller retains
/// the buffer and retries once more data has arrived.
pub fn decode(
    ctx: &DecoderContext,
    buf: &[u8],
) -> Result<Option<(BerValue, usize)>, DecodeError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let (tag, length, header) = read_header(buf)?;
    if buf.len() < header + length {
        return Err(DecodeError::InsufficientData);
    }
    let content = &buf[header..header + length];
    let value = decode_content(ctx, tag, content)?;
    Ok(Some((value, header + length)))
}

/// Parse the identification octet and definite length. Returns
/// (tag, content length, header length).
fn read_header(buf: &[u8]) -> Result<(Tag, usize, usize), DecodeError> {
    if buf[0] & 0x1F == 0x1F {
        return Err(DecodeError::LongFormTag);
    }
    let tag = Tag::from_octet(buf[0]);
    if buf.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    let first = buf[1];
    if first & 0x80 == 0 {
        return Ok((tag, first as usize, 2));
    }
    let length_octets = (first & 0x7F) as usize;
    if length_octets == 0 {
        return Err(DecodeError::IndefiniteLength);
    }
    if length_octets > 8 {
        return Err(DecodeError::LengthTooLarge(length_octets));
    }
    if buf.len() < 2 + length_octets {
        return Err(DecodeError::InsufficientData);
    }
    let mut length = 0usize;
    for i in 0..length_octets {
        length = (length << 8) | buf[2 + i] as usize;
    }
    Ok((tag, length, 2 + length_octets))
}

fn decode_content(ctx: &DecoderContext, tag: Tag, content: &[u8]) -> Result<BerValue, DecodeError> {
    let shape = ctx.lookup(tag).ok_or(DecodeError::UnknownTag(tag))?;
    let decoded = match shape {
        Shape::Boolean => {
            if content.len() != 1 {
                return Err(DecodeError::Malformed("boolean content must be one octet"));
            }
            Content::Boolean(content[0] != 0)
        }
        Shape::Integer => {
            if content.is_empty() {
                return Err(DecodeError::Malformed("integer content must not be empty"));
            }
            if content.len() > 8 {
                return Err(DecodeError::Malformed("integer content exceeds 8 octets"));
            }
            let mut value = if content[0] & 0x80 != 0 { -1i64 } else { 0i64 };
            for &b in content {
                value = (value << 8) | b as i64;
            }
            Content::Integer(value)
        }
        Shape::OctetString => Content::OctetString(content.to_vec()),
        Shape::Null => {
            if !content.is_empty() {
                return Err(DecodeError::Malformed("null content must be empty"));
            }
            Content::Null
        }
        Shape::Constructed => {
            let child_ctx = ctx.inherit();
            let mut children = Vec::new();
            let mut offset = 0;
            while offset < content.len() {
                // A child running past its complete parent is corruption of
                // the PDU itself, not a recoverable partial read.
                match decode(child_ctx, &content[offset..]) {
                    Ok(Some((child, used))) => {
                        children.push(child);
                        offset += used;
                    }
                    Ok(None) => unreachable!("slice checked non-empty"),
                    Err(DecodeError::InsufficientData) => {
                        return Err(DecodeError::Malformed("child value exceeds parent length"));
                    }
                    Err(e) => return Err(e),
                }
            }
            Content::Constructed(children)
        }
    };
    Ok(BerValue { tag, content: decoded })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(ctx: &DecoderContext, value: BerValue) {
        let bytes = encode(&value);
        let (decoded, used) = decode(ctx, &bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_integer_128_encoding() {
        // Sign octet needed: 128 is [0x02, 0x02, 0x00, 0x80].
        assert_eq!(encode(&BerValue::integer(128)), vec![0x02, 0x02, 0x00, 0x80]);
        let (v, _) = decode(&UNIVERSAL, &[0x02, 0x02, 0x00, 0x80]).unwrap().unwrap();
        assert_eq!(v.as_integer(), Some(128));
    }

    #[test]
    fn test_integer_encodings_are_minimal() {
        assert_eq!(encode(&BerValue::integer(0)), vec![0x02, 0x01, 0x00]);
        assert_eq!(encode(&BerValue::integer(127)), vec![0x02, 0x01, 0x7F]);
        assert_eq!(encode(&BerValue::integer(-1)), vec![0x02, 0x01, 0xFF]);
        assert_eq!(encode(&BerValue::integer(-128)), vec![0x02, 0x01, 0x80]);
        assert_eq!(encode(&BerValue::integer(256)), vec![0x02, 0x02, 0x01, 0x00]);
        assert_eq!(encode(&BerValue::integer(-129)), vec![0x02, 0x02, 0xFF, 0x7F]);
    }

    #[test]
    fn test_round_trip_scalars() {
        round_trip(&UNIVERSAL, BerValue::boolean(true));
        round_trip(&UNIVERSAL, BerValue::boolean(false));
        round_trip(&UNIVERSAL, BerValue::integer(0));
        round_trip(&UNIVERSAL, BerValue::integer(i64::MAX));
        round_trip(&UNIVERSAL, BerValue::integer(i64::MIN));
        round_trip(&UNIVERSAL, BerValue::enumerated(2));
        round_trip(&UNIVERSAL, BerValue::octet_string(b"hello".to_vec()));
        round_trip(&UNIVERSAL, BerValue::octet_string(Vec::new()));
        round_trip(&UNIVERSAL, BerValue::null());
    }

    #[test]
    fn test_round_trip_nested() {
        round_trip(
            &UNIVERSAL,
            BerValue::sequence(vec![
                BerValue::integer(42),
                BerValue::string("cn=test,dc=example,dc=com"),
                BerValue::set(vec![BerValue::string("a"), BerValue::string("b")]),
                BerValue::sequence(vec![]),
            ]),
        );
    }

    #[test]
    fn test_long_form_length() {
        // 200 bytes of content forces a 0x81 length-of-length prefix.
        let value = BerValue::octet_string(vec![0xAB; 200]);
        let bytes = encode(&value);
        assert_eq!(bytes[1], 0x81);
        assert_eq!(bytes[2], 200);
        round_trip(&UNIVERSAL, value);
    }

    #[test]
    fn test_empty_buffer_is_none() {
        assert_eq!(decode(&UNIVERSAL, &[]).unwrap(), None);
    }

    #[test]
    fn test_every_split_point_is_insufficient() {
        let value = BerValue::sequence(vec![
            BerValue::integer(1),
            BerValue::string("hello"),
            BerValue::octet_string(vec![0u8; 140]),
        ]);
        let bytes = encode(&value);
        for split in 1..bytes.len() {
            assert_eq!(
                decode(&UNIVERSAL, &bytes[..split]),
                Err(DecodeError::InsufficientData),
                "split at {} must report insufficient data",
                split
            );
        }
        let (decoded, used) = decode(&UNIVERSAL, &bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_unknown_tag_is_strict_error() {
        // Context tag [5] with no resolving context.
        let bytes = [0x85, 0x01, 0x00];
        match decode(&UNIVERSAL, &bytes) {
            Err(DecodeError::UnknownTag(tag)) => {
                assert_eq!(tag, Tag::context_primitive(5));
            }
            other => panic!("expected UnknownTag, got {:?}", other),
        }
    }

    #[test]
    fn test_indefinite_length_rejected() {
        assert_eq!(
            decode(&UNIVERSAL, &[0x30, 0x80, 0x00, 0x00]),
            Err(DecodeError::IndefiniteLength)
        );
    }

    #[test]
    fn test_truncated_child_is_malformed() {
        // SEQUENCE of total length 3 whose child claims 5 content octets.
        let bytes = [0x30, 0x03, 0x04, 0x05, 0xAA];
        assert_eq!(
            decode(&UNIVERSAL, &bytes),
            Err(DecodeError::Malformed("child value exceeds parent length"))
        );
    }

    #[test]
    fn test_fallback_chain_lookup() {
        static APP: DecoderContext = DecoderContext::new(
            &[(Tag::application(1), Shape::Constructed)],
            Some(&UNIVERSAL),
            None,
        );
        assert_eq!(APP.lookup(Tag::application(1)), Some(Shape::Constructed));
        assert_eq!(APP.lookup(Tag::universal(TAG_INTEGER)), Some(Shape::Integer));
        assert_eq!(APP.lookup(Tag::context(9)), None);
    }

    #[test]
    fn test_inherit_switches_child_context() {
        // [1] constructed is only known to OUTER; its children resolve [2]
        // primitive through INNER. The same [2] is unknown at the outer level.
        static INNER: DecoderContext = DecoderContext::new(
            &[(Tag::context_primitive(2), Shape::OctetString)],
            Some(&UNIVERSAL),
            None,
        );
        static OUTER: DecoderContext = DecoderContext::new(
            &[(Tag::context(1), Shape::Constructed)],
            Some(&UNIVERSAL),
            Some(&INNER),
        );
        let value = BerValue::tagged(
            Tag::context(1),
            Content::Constructed(vec![BerValue::tagged(
                Tag::context_primitive(2),
                Content::OctetString(b"x".to_vec()),
            )]),
        );
        let bytes = encode(&value);
        let (decoded, _) = decode(&OUTER, &bytes).unwrap().unwrap();
        assert_eq!(decoded, value);

        let child_alone = encode(&BerValue::tagged(
            Tag::context_primitive(2),
            Content::OctetString(b"x".to_vec()),
        ));
        assert!(matches!(
            decode(&OUTER, &child_alone),
            Err(DecodeError::UnknownTag(_))
        ));
    }

    #[test]
    fn test_canonical_bytes_re_encode_identically() {
        let bytes = vec![
            0x30, 0x0C, 0x02, 0x01, 0x07, 0x04, 0x03, b'a', b'b', b'c', 0x01, 0x01, 0xFF,
        ];
        let (decoded, used) = decode(&UNIVERSAL, &bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(encode(&decoded), bytes);
    }
}
