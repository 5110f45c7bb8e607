//! Search filters: the AST, the RFC 2254 text grammar, and the BER form used
//! inside SearchRequest.
//!
//! The same structure comes out of `parse` and out of programmatic
//! construction, and both render back to text with `to_text`. Extensible
//! match exists in the AST (it arrives over the wire), but the text grammar
//! does not accept it: `attr:=value` fails with a parse error instead of
//! mis-parsing as an equality on a weird attribute name.

use std::fmt;

use thiserror::Error;

use crate::ber::{BerValue, Content, Tag};
use crate::error::LdapError;

// Filter CHOICE context tags (RFC 4511 section 4.5.1.7).
const FILTER_AND: u32 = 0;
const FILTER_OR: u32 = 1;
const FILTER_NOT: u32 = 2;
const FILTER_EQUALITY: u32 = 3;
const FILTER_SUBSTRINGS: u32 = 4;
const FILTER_GREATER_OR_EQUAL: u32 = 5;
const FILTER_LESS_OR_EQUAL: u32 = 6;
const FILTER_PRESENT: u32 = 7;
const FILTER_APPROX: u32 = 8;
const FILTER_EXTENSIBLE: u32 = 9;

// ExtensibleMatch member tags.
const MATCHING_RULE: u32 = 1;
const MATCHING_TYPE: u32 = 2;
const MATCHING_VALUE: u32 = 3;
const MATCHING_DN_ATTRIBUTES: u32 = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterParseError {
    #[error("unexpected end of filter text")]
    UnexpectedEnd,

    #[error("expected {expected:?} at offset {offset}")]
    Expected { expected: char, offset: usize },

    #[error("extensible match filters are not supported in text form (offset {0})")]
    ExtensibleMatch(usize),

    #[error("invalid hex escape at offset {0}")]
    InvalidEscape(usize),

    #[error("empty attribute description at offset {0}")]
    EmptyAttribute(usize),

    #[error("trailing data after filter at offset {0}")]
    TrailingData(usize),
}

/// A search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality { attribute: String, value: String },
    Substrings {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        final_: Option<String>,
    },
    GreaterOrEqual { attribute: String, value: String },
    LessOrEqual { attribute: String, value: String },
    Present { attribute: String },
    ApproxMatch { attribute: String, value: String },
    ExtensibleMatch {
        matching_rule: Option<String>,
        match_type: Option<String>,
        match_value: String,
        dn_attributes: bool,
    },
}

/// Escape a filter assertion value: `\ * ( )` and NUL become `\XX` hex pairs.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            c => out.push(c),
        }
    }
    out
}

impl Filter {
    pub fn equality(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equality { attribute: attribute.into(), value: value.into() }
    }

    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present { attribute: attribute.into() }
    }

    /// Render to text. The exact inverse of [`parse_filter`] for every
    /// variant the text grammar supports.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        self.render(&mut out);
        out
    }

    fn render(&self, out: &mut String) {
        match self {
            Filter::And(filters) => {
                out.push_str("(&");
                for f in filters {
                    f.render(out);
                }
                out.push(')');
            }
            Filter::Or(filters) => {
                out.push_str("(|");
                for f in filters {
                    f.render(out);
                }
                out.push(')');
            }
            Filter::Not(inner) => {
                out.push_str("(!");
                inner.render(out);
                out.push(')');
            }
            Filter::Equality { attribute, value } => {
                out.push('(');
                out.push_str(attribute);
                out.push('=');
                out.push_str(&escape_value(value));
                out.push(')');
            }
            Filter::Substrings { attribute, initial, any, final_ } => {
                out.push('(');
                out.push_str(attribute);
                out.push('=');
                if let Some(initial) = initial {
                    out.push_str(&escape_value(initial));
                }
                out.push('*');
                for piece in any {
                    out.push_str(&escape_value(piece));
                    out.push('*');
                }
                if let Some(final_) = final_ {
                    out.push_str(&escape_value(final_));
                }
                out.push(')');
            }
            Filter::GreaterOrEqual { attribute, value } => {
                out.push('(');
                out.push_str(attribute);
                out.push_str(">=");
                out.push_str(&escape_value(value));
                out.push(')');
            }
            Filter::LessOrEqual { attribute, value } => {
                out.push('(');
                out.push_str(attribute);
                out.push_str("<=");
                out.push_str(&escape_value(value));
                out.push(')');
            }
            Filter::Present { attribute } => {
                out.push('(');
                out.push_str(attribute);
                out.push_str("=*)");
            }
            Filter::ApproxMatch { attribute, value } => {
                out.push('(');
                out.push_str(attribute);
                out.push_str("~=");
                out.push_str(&escape_value(value));
                out.push(')');
            }
            Filter::ExtensibleMatch { matching_rule, match_type, match_value, dn_attributes } => {
                // Rendered for logs and diagnostics; the text parser does not
                // accept this form back.
                out.push('(');
                if let Some(t) = match_type {
                    out.push_str(t);
                }
                if *dn_attributes {
                    out.push_str(":dn");
                }
                if let Some(rule) = matching_rule {
                    out.push(':');
                    out.push_str(rule);
                }
                out.push_str(":=");
                out.push_str(&escape_value(match_value));
                out.push(')');
            }
        }
    }

    /// The BER form used inside SearchRequest (context tags 0-9).
    pub fn to_ber(&self) -> BerValue {
        match self {
            Filter::And(filters) => BerValue::tagged(
                Tag::context(FILTER_AND),
                Content::Constructed(filters.iter().map(|f| f.to_ber()).collect()),
            ),
            Filter::Or(filters) => BerValue::tagged(
                Tag::context(FILTER_OR),
                Content::Constructed(filters.iter().map(|f| f.to_ber()).collect()),
            ),
            Filter::Not(inner) => BerValue::tagged(
                Tag::context(FILTER_NOT),
                Content::Constructed(vec![inner.to_ber()]),
            ),
            Filter::Equality { attribute, value } => {
                assertion(FILTER_EQUALITY, attribute, value)
            }
            Filter::Substrings { attribute, initial, any, final_ } => {
                let mut pieces = Vec::new();
                if let Some(initial) = initial {
                    pieces.push(BerValue::tagged(
                        Tag::context_primitive(0),
                        Content::OctetString(initial.as_bytes().to_vec()),
                    ));
                }
                for piece in any {
                    pieces.push(BerValue::tagged(
                        Tag::context_primitive(1),
                        Content::OctetString(piece.as_bytes().to_vec()),
                    ));
                }
                if let Some(final_) = final_ {
                    pieces.push(BerValue::tagged(
                        Tag::context_primitive(2),
                        Content::OctetString(final_.as_bytes().to_vec()),
                    ));
                }
                BerValue::tagged(
                    Tag::context(FILTER_SUBSTRINGS),
                    Content::Constructed(vec![
                        BerValue::string(attribute),
                        BerValue::sequence(pieces),
                    ]),
                )
            }
            Filter::GreaterOrEqual { attribute, value } => {
                assertion(FILTER_GREATER_OR_EQUAL, attribute, value)
            }
            Filter::LessOrEqual { attribute, value } => {
                assertion(FILTER_LESS_OR_EQUAL, attribute, value)
            }
            Filter::Present { attribute } => BerValue::tagged(
                Tag::context_primitive(FILTER_PRESENT),
                Content::OctetString(attribute.as_bytes().to_vec()),
            ),
            Filter::ApproxMatch { attribute, value } => {
                assertion(FILTER_APPROX, attribute, value)
            }
            Filter::ExtensibleMatch { matching_rule, match_type, match_value, dn_attributes } => {
                let mut members = Vec::new();
                if let Some(rule) = matching_rule {
                    members.push(BerValue::tagged(
                        Tag::context_primitive(MATCHING_RULE),
                        Content::OctetString(rule.as_bytes().to_vec()),
                    ));
                }
                if let Some(t) = match_type {
                    members.push(BerValue::tagged(
                        Tag::context_primitive(MATCHING_TYPE),
                        Content::OctetString(t.as_bytes().to_vec()),
                    ));
                }
                members.push(BerValue::tagged(
                    Tag::context_primitive(MATCHING_VALUE),
                    Content::OctetString(match_value.as_bytes().to_vec()),
                ));
                if *dn_attributes {
                    members.push(BerValue::tagged(
                        Tag::context_primitive(MATCHING_DN_ATTRIBUTES),
                        Content::Boolean(true),
                    ));
                }
                BerValue::tagged(Tag::context(FILTER_EXTENSIBLE), Content::Constructed(members))
            }
        }
    }

    /// Rebuild a filter from its BER form.
    pub fn from_ber(value: &BerValue) -> Result<Filter, LdapError> {
        if value.tag.class != crate::ber::TagClass::Context {
            return Err(shape_error("filter tag is not context-specific"));
        }
        match value.tag.number {
            FILTER_AND | FILTER_OR => {
                let children = value
                    .children()
                    .ok_or_else(|| shape_error("filter set is not constructed"))?
                    .iter()
                    .map(Filter::from_ber)
                    .collect::<Result<Vec<_>, _>>()?;
                if value.tag.number == FILTER_AND {
                    Ok(Filter::And(children))
                } else {
                    Ok(Filter::Or(children))
                }
            }
            FILTER_NOT => {
                let children = value
                    .children()
                    .ok_or_else(|| shape_error("not filter is not constructed"))?;
                match children {
                    [inner] => Ok(Filter::Not(Box::new(Filter::from_ber(inner)?))),
                    _ => Err(shape_error("not filter must hold exactly one filter")),
                }
            }
            FILTER_EQUALITY | FILTER_GREATER_OR_EQUAL | FILTER_LESS_OR_EQUAL | FILTER_APPROX => {
                let (attribute, assertion_value) = parse_assertion(value)?;
                Ok(match value.tag.number {
                    FILTER_EQUALITY => Filter::Equality { attribute, value: assertion_value },
                    FILTER_GREATER_OR_EQUAL => {
                        Filter::GreaterOrEqual { attribute, value: assertion_value }
                    }
                    FILTER_LESS_OR_EQUAL => {
                        Filter::LessOrEqual { attribute, value: assertion_value }
                    }
                    _ => Filter::ApproxMatch { attribute, value: assertion_value },
                })
            }
            FILTER_SUBSTRINGS => {
                let children = value
                    .children()
                    .ok_or_else(|| shape_error("substrings filter is not constructed"))?;
                let [attr, pieces] = children else {
                    return Err(shape_error("substrings filter must hold type and pieces"));
                };
                let attribute = string_content(attr, "substrings attribute")?;
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_ = None;
                for piece in pieces
                    .children()
                    .ok_or_else(|| shape_error("substring pieces are not a sequence"))?
                {
                    let text = string_content(piece, "substring piece")?;
                    match piece.tag.number {
                        0 if initial.is_none() && any.is_empty() && final_.is_none() => {
                            initial = Some(text)
                        }
                        1 if final_.is_none() => any.push(text),
                        2 if final_.is_none() => final_ = Some(text),
                        _ => return Err(shape_error("substring pieces out of order")),
                    }
                }
                Ok(Filter::Substrings { attribute, initial, any, final_ })
            }
            FILTER_PRESENT => Ok(Filter::Present {
                attribute: string_content(value, "present filter attribute")?,
            }),
            FILTER_EXTENSIBLE => {
                let mut matching_rule = None;
                let mut match_type = None;
                let mut match_value = None;
                let mut dn_attributes = false;
                for member in value
                    .children()
                    .ok_or_else(|| shape_error("extensible match is not constructed"))?
                {
                    match member.tag.number {
                        MATCHING_RULE => matching_rule = Some(string_content(member, "matchingRule")?),
                        MATCHING_TYPE => match_type = Some(string_content(member, "matching type")?),
                        MATCHING_VALUE => match_value = Some(string_content(member, "matchValue")?),
                        MATCHING_DN_ATTRIBUTES => {
                            dn_attributes = member
                                .as_bool()
                                .ok_or_else(|| shape_error("dnAttributes is not a boolean"))?
                        }
                        _ => return Err(shape_error("unexpected member in extensible match")),
                    }
                }
                Ok(Filter::ExtensibleMatch {
                    matching_rule,
                    match_type,
                    match_value: match_value
                        .ok_or_else(|| shape_error("extensible match without matchValue"))?,
                    dn_attributes,
                })
            }
            _ => Err(shape_error("unknown filter choice tag")),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

fn assertion(tag_number: u32, attribute: &str, value: &str) -> BerValue {
    BerValue::tagged(
        Tag::context(tag_number),
        Content::Constructed(vec![BerValue::string(attribute), BerValue::string(value)]),
    )
}

fn parse_assertion(value: &BerValue) -> Result<(String, String), LdapError> {
    let children = value
        .children()
        .ok_or_else(|| shape_error("attribute assertion is not constructed"))?;
    let [attr, assertion_value] = children else {
        return Err(shape_error("attribute assertion must hold type and value"));
    };
    Ok((
        string_content(attr, "assertion attribute")?,
        string_content(assertion_value, "assertion value")?,
    ))
}

fn string_content(value: &BerValue, what: &str) -> Result<String, LdapError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| LdapError::Protocol(format!("{} is not a UTF-8 string", what)))
}

fn shape_error(message: &str) -> LdapError {
    LdapError::Protocol(message.to_string())
}

/// Parse RFC 2254 filter text.
pub fn parse_filter(text: &str) -> Result<Filter, FilterParseError> {
    let bytes = text.as_bytes();
    let mut parser = Parser { bytes, offset: 0 };
    let filter = parser.filter()?;
    if parser.offset != bytes.len() {
        return Err(FilterParseError::TrailingData(parser.offset));
    }
    Ok(filter)
}

struct Parser<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.offset).copied()
    }

    fn expect(&mut self, expected: u8) -> Result<(), FilterParseError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.offset += 1;
                Ok(())
            }
            Some(_) => Err(FilterParseError::Expected {
                expected: expected as char,
                offset: self.offset,
            }),
            None => Err(FilterParseError::UnexpectedEnd),
        }
    }

    /// filter = "(" filtercomp ")"
    fn filter(&mut self) -> Result<Filter, FilterParseError> {
        self.expect(b'(')?;
        let comp = match self.peek() {
            Some(b'&') => {
                self.offset += 1;
                Filter::And(self.filter_list()?)
            }
            Some(b'|') => {
                self.offset += 1;
                Filter::Or(self.filter_list()?)
            }
            Some(b'!') => {
                self.offset += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(FilterParseError::UnexpectedEnd),
        };
        self.expect(b')')?;
        Ok(comp)
    }

    /// filterlist = 1*filter
    fn filter_list(&mut self) -> Result<Vec<Filter>, FilterParseError> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.filter()?);
        }
        Ok(filters)
    }

    /// item: attr ["~" / ">" / "<"] "=" value, or the unsupported
    /// extensible-match forms which must fail loudly.
    fn item(&mut self) -> Result<Filter, FilterParseError> {
        let attr_start = self.offset;
        while let Some(c) = self.peek() {
            if matches!(c, b'=' | b'~' | b'>' | b'<' | b':' | b')' | b'(') {
                break;
            }
            self.offset += 1;
        }
        let attribute = std::str::from_utf8(&self.bytes[attr_start..self.offset])
            .expect("attribute span sliced on ASCII boundaries")
            .to_string();
        match self.peek() {
            Some(b':') => return Err(FilterParseError::ExtensibleMatch(self.offset)),
            Some(b'~') => {
                self.offset += 1;
                self.expect(b'=')?;
                if attribute.is_empty() {
                    return Err(FilterParseError::EmptyAttribute(attr_start));
                }
                let value = self.value()?;
                return Ok(Filter::ApproxMatch { attribute, value: unescape_plain(&value, attr_start)? });
            }
            Some(b'>') => {
                self.offset += 1;
                self.expect(b'=')?;
                if attribute.is_empty() {
                    return Err(FilterParseError::EmptyAttribute(attr_start));
                }
                let value = self.value()?;
                return Ok(Filter::GreaterOrEqual { attribute, value: unescape_plain(&value, attr_start)? });
            }
            Some(b'<') => {
                self.offset += 1;
                self.expect(b'=')?;
                if attribute.is_empty() {
                    return Err(FilterParseError::EmptyAttribute(attr_start));
                }
                let value = self.value()?;
                return Ok(Filter::LessOrEqual { attribute, value: unescape_plain(&value, attr_start)? });
            }
            Some(b'=') => {
                self.offset += 1;
            }
            Some(_) => {
                return Err(FilterParseError::Expected { expected: '=', offset: self.offset })
            }
            None => return Err(FilterParseError::UnexpectedEnd),
        }
        if attribute.is_empty() {
            return Err(FilterParseError::EmptyAttribute(attr_start));
        }
        let raw = self.value()?;
        if raw == "*" {
            return Ok(Filter::Present { attribute });
        }
        if contains_unescaped_star(&raw) {
            return self.substrings(attribute, &raw, attr_start);
        }
        Ok(Filter::Equality { attribute, value: unescape_plain(&raw, attr_start)? })
    }

    /// Raw value text up to the closing paren, escapes intact.
    fn value(&mut self) -> Result<String, FilterParseError> {
        let start = self.offset;
        while let Some(c) = self.peek() {
            match c {
                b')' => break,
                b'(' => {
                    return Err(FilterParseError::Expected { expected: ')', offset: self.offset })
                }
                b'\\' => self.offset += 2,
                _ => self.offset += 1,
            }
        }
        if self.offset > self.bytes.len() {
            return Err(FilterParseError::UnexpectedEnd);
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.offset]).into_owned())
    }

    /// Split a `*`-bearing raw value into initial / any / final segments,
    /// each unescaped independently.
    fn substrings(
        &self,
        attribute: String,
        raw: &str,
        offset: usize,
    ) -> Result<Filter, FilterParseError> {
        let segments = split_on_unescaped_star(raw);
        let n = segments.len();
        let mut initial = None;
        let mut any = Vec::new();
        let mut final_ = None;
        for (i, segment) in segments.into_iter().enumerate() {
            if segment.is_empty() {
                continue;
            }
            let text = unescape_plain(&segment, offset)?;
            if i == 0 {
                initial = Some(text);
            } else if i == n - 1 {
                final_ = Some(text);
            } else {
                any.push(text);
            }
        }
        Ok(Filter::Substrings { attribute, initial, any, final_ })
    }
}

fn contains_unescaped_star(raw: &str) -> bool {
    let mut escaped = false;
    for c in raw.chars() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '*' {
            return true;
        }
    }
    false
}

fn split_on_unescaped_star(raw: &str) -> Vec<String> {
    let mut segments = vec![String::new()];
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let last = segments.last_mut().expect("segments never empty");
            last.push(c);
            if let Some(next) = chars.next() {
                last.push(next);
            }
        } else if c == '*' {
            segments.push(String::new());
        } else {
            segments.last_mut().expect("segments never empty").push(c);
        }
    }
    segments
}

/// Invert [`escape_value`] over one segment (no unescaped `*` inside).
fn unescape_plain(raw: &str, offset: usize) -> Result<String, FilterParseError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let hi = chars.next().ok_or(FilterParseError::InvalidEscape(offset))?;
        let lo = chars.next().ok_or(FilterParseError::InvalidEscape(offset))?;
        let pair: String = [hi, lo].iter().collect();
        let byte = u8::from_str_radix(&pair, 16)
            .map_err(|_| FilterParseError::InvalidEscape(offset))?;
        out.push(byte as char);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(text: &str) -> Filter {
        let filter = parse_filter(text).unwrap();
        assert_eq!(filter.to_text(), text, "render is not the inverse of parse");
        filter
    }

    #[test]
    fn test_parse_equality() {
        let filter = round_trip("(cn=foo)");
        assert_eq!(filter, Filter::equality("cn", "foo"));
    }

    #[test]
    fn test_parse_nested_boolean() {
        let filter = round_trip("(&(cn=foo)(|(uid=bar)(mail=bar)))");
        assert_eq!(
            filter,
            Filter::And(vec![
                Filter::equality("cn", "foo"),
                Filter::Or(vec![
                    Filter::equality("uid", "bar"),
                    Filter::equality("mail", "bar"),
                ]),
            ])
        );
    }

    #[test]
    fn test_parse_not() {
        let filter = round_trip("(!(objectClass=device))");
        assert_eq!(
            filter,
            Filter::Not(Box::new(Filter::equality("objectClass", "device")))
        );
    }

    #[test]
    fn test_parse_present() {
        assert_eq!(round_trip("(cn=*)"), Filter::present("cn"));
    }

    #[test]
    fn test_parse_ordering_and_approx() {
        assert_eq!(
            round_trip("(uidNumber>=1000)"),
            Filter::GreaterOrEqual { attribute: "uidNumber".into(), value: "1000".into() }
        );
        assert_eq!(
            round_trip("(uidNumber<=2000)"),
            Filter::LessOrEqual { attribute: "uidNumber".into(), value: "2000".into() }
        );
        assert_eq!(
            round_trip("(cn~=smith)"),
            Filter::ApproxMatch { attribute: "cn".into(), value: "smith".into() }
        );
    }

    #[test]
    fn test_parse_substrings() {
        assert_eq!(
            round_trip("(cn=foo*bar)"),
            Filter::Substrings {
                attribute: "cn".into(),
                initial: Some("foo".into()),
                any: vec![],
                final_: Some("bar".into()),
            }
        );
        assert_eq!(
            round_trip("(cn=foo*mid1*mid2*bar)"),
            Filter::Substrings {
                attribute: "cn".into(),
                initial: Some("foo".into()),
                any: vec!["mid1".into(), "mid2".into()],
                final_: Some("bar".into()),
            }
        );
        assert_eq!(
            round_trip("(cn=*tail)"),
            Filter::Substrings {
                attribute: "cn".into(),
                initial: None,
                any: vec![],
                final_: Some("tail".into()),
            }
        );
        assert_eq!(
            round_trip("(cn=head*)"),
            Filter::Substrings {
                attribute: "cn".into(),
                initial: Some("head".into()),
                any: vec![],
                final_: None,
            }
        );
    }

    #[test]
    fn test_escapes_round_trip() {
        let filter = round_trip("(cn=a\\2ab)");
        assert_eq!(filter, Filter::equality("cn", "a*b"));
        let filter = round_trip("(cn=par\\28en\\29)");
        assert_eq!(filter, Filter::equality("cn", "par(en)"));
        // Programmatic construction renders escaped.
        assert_eq!(Filter::equality("cn", "a\\b").to_text(), "(cn=a\\5cb)");
    }

    #[test]
    fn test_extensible_match_text_is_rejected() {
        assert!(matches!(
            parse_filter("(cn:=foo)"),
            Err(FilterParseError::ExtensibleMatch(_))
        ));
        assert!(matches!(
            parse_filter("(cn:dn:2.4.6.8.10:=foo)"),
            Err(FilterParseError::ExtensibleMatch(_))
        ));
        assert!(matches!(
            parse_filter("(:caseExactMatch:=foo)"),
            Err(FilterParseError::ExtensibleMatch(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_filter("cn=foo"), Err(FilterParseError::Expected { .. })));
        assert!(matches!(parse_filter("(cn=foo"), Err(FilterParseError::UnexpectedEnd)));
        assert!(matches!(
            parse_filter("(cn=foo)x"),
            Err(FilterParseError::TrailingData(_))
        ));
        assert!(matches!(parse_filter("(=foo)"), Err(FilterParseError::EmptyAttribute(_))));
        assert!(matches!(parse_filter(""), Err(FilterParseError::UnexpectedEnd)));
    }

    #[test]
    fn test_ber_round_trip() {
        for text in [
            "(cn=foo)",
            "(&(cn=foo)(|(uid=bar)(mail=bar)))",
            "(!(cn=foo))",
            "(cn=*)",
            "(cn=foo*mid*bar)",
            "(uidNumber>=1000)",
            "(uidNumber<=2000)",
            "(cn~=smith)",
        ] {
            let filter = parse_filter(text).unwrap();
            let decoded = Filter::from_ber(&filter.to_ber()).unwrap();
            assert_eq!(decoded, filter, "BER round-trip changed {:?}", text);
        }
    }

    #[test]
    fn test_extensible_ber_round_trip() {
        let filter = Filter::ExtensibleMatch {
            matching_rule: Some("caseExactMatch".into()),
            match_type: Some("cn".into()),
            match_value: "foo".into(),
            dn_attributes: true,
        };
        assert_eq!(Filter::from_ber(&filter.to_ber()).unwrap(), filter);

        let minimal = Filter::ExtensibleMatch {
            matching_rule: None,
            match_type: None,
            match_value: "foo".into(),
            dn_attributes: false,
        };
        assert_eq!(Filter::from_ber(&minimal.to_ber()).unwrap(), minimal);
    }

    #[test]
    fn test_present_ber_is_primitive() {
        let ber = Filter::present("cn").to_ber();
        assert!(!ber.tag.constructed);
        assert_eq!(ber.tag.number, 7);
    }
}
