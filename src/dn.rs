//! Distinguished names: parse, escape, compare, containment.
//!
//! Text form follows RFC 2253: RDNs joined by `,` outermost first, multi-valued
//! RDNs joined by `+`, values escaped per section 2.4. Attribute types and
//! values compare case-insensitively.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnParseError {
    #[error("attribute without '=' separator: {0:?}")]
    MissingEquals(String),

    #[error("empty attribute type in {0:?}")]
    EmptyAttributeType(String),

    #[error("dangling escape at end of input")]
    DanglingEscape,

    #[error("invalid hex escape {0:?}")]
    InvalidHexEscape(String),
}

/// Escape one attribute value for text form (RFC 2253 section 2.4).
///
/// The specials `, + " \ < > ; =` are backslash-escaped anywhere; a leading
/// space or `#` and a trailing space are escaped; control characters become
/// `\HH` hex pairs.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(c);
            }
            ' ' if i == 0 || i == last => {
                out.push('\\');
                out.push(' ');
            }
            '#' if i == 0 => {
                out.push('\\');
                out.push('#');
            }
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Invert [`escape`]: `\HH` hex pairs and `\X` literal escapes.
pub fn unescape(value: &str) -> Result<String, DnParseError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let first = chars.next().ok_or(DnParseError::DanglingEscape)?;
        if first.is_ascii_hexdigit() {
            let second = chars.next().ok_or(DnParseError::DanglingEscape)?;
            let pair: String = [first, second].iter().collect();
            let byte = u8::from_str_radix(&pair, 16)
                .map_err(|_| DnParseError::InvalidHexEscape(pair.clone()))?;
            out.push(byte as char);
        } else {
            out.push(first);
        }
    }
    Ok(out)
}

/// Split on an unescaped separator, copying `\X` pairs verbatim into the
/// pieces. Spaces immediately after a separator are skipped.
fn split_unescaped(text: &str, separator: char) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == separator {
            pieces.push(current);
            current = String::new();
            while chars.peek() == Some(&' ') {
                chars.next();
            }
        } else {
            current.push(c);
        }
    }
    pieces.push(current);
    pieces
}

/// One attributeType=value pair. Both fields compare case-insensitively.
#[derive(Debug, Clone)]
pub struct AttributeTypeAndValue {
    pub attribute_type: String,
    pub value: String,
}

impl AttributeTypeAndValue {
    pub fn new(attribute_type: impl Into<String>, value: impl Into<String>) -> Self {
        AttributeTypeAndValue {
            attribute_type: attribute_type.into(),
            value: value.into(),
        }
    }

    fn parse(text: &str) -> Result<Self, DnParseError> {
        // Find the first unescaped '='.
        let mut split_at = None;
        let mut escaped = false;
        for (i, c) in text.char_indices() {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '=' {
                split_at = Some(i);
                break;
            }
        }
        let at = split_at.ok_or_else(|| DnParseError::MissingEquals(text.to_string()))?;
        let attribute_type = text[..at].trim().to_string();
        if attribute_type.is_empty() {
            return Err(DnParseError::EmptyAttributeType(text.to_string()));
        }
        let value = unescape(&text[at + 1..])?;
        Ok(AttributeTypeAndValue { attribute_type, value })
    }

    fn key(&self) -> (String, String) {
        (self.attribute_type.to_lowercase(), self.value.to_lowercase())
    }
}

impl PartialEq for AttributeTypeAndValue {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for AttributeTypeAndValue {}

impl PartialOrd for AttributeTypeAndValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AttributeTypeAndValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for AttributeTypeAndValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attribute_type, escape(&self.value))
    }
}

/// One RDN: an ordered set of attribute pairs, `+`-joined when multi-valued.
/// Equality ignores the presentation order of a multi-valued RDN.
#[derive(Debug, Clone)]
pub struct RelativeDistinguishedName {
    pub components: Vec<AttributeTypeAndValue>,
}

impl RelativeDistinguishedName {
    pub fn new(components: Vec<AttributeTypeAndValue>) -> Self {
        RelativeDistinguishedName { components }
    }

    pub fn single(attribute_type: impl Into<String>, value: impl Into<String>) -> Self {
        RelativeDistinguishedName {
            components: vec![AttributeTypeAndValue::new(attribute_type, value)],
        }
    }

    fn parse(text: &str) -> Result<Self, DnParseError> {
        let components = split_unescaped(text, '+')
            .iter()
            .map(|piece| AttributeTypeAndValue::parse(piece))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RelativeDistinguishedName { components })
    }
}

impl PartialEq for RelativeDistinguishedName {
    fn eq(&self, other: &Self) -> bool {
        if self.components.len() != other.components.len() {
            return false;
        }
        let mut a = self.components.clone();
        let mut b = other.components.clone();
        a.sort();
        b.sort();
        a.iter().zip(b.iter()).all(|(x, y)| x == y)
    }
}

impl Eq for RelativeDistinguishedName {}

impl fmt::Display for RelativeDistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.components.iter().map(|c| c.to_string()).collect();
        f.write_str(&rendered.join("+"))
    }
}

/// A distinguished name: RDN sequence, outermost (leftmost in text) first.
///
/// The canonical text form round-trips: `parse(render(parse(s))) == parse(s)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DistinguishedName {
    pub rdns: Vec<RelativeDistinguishedName>,
}

impl DistinguishedName {
    pub fn new(rdns: Vec<RelativeDistinguishedName>) -> Self {
        DistinguishedName { rdns }
    }

    /// The empty DN (the directory root). It contains every DN.
    pub fn root() -> Self {
        DistinguishedName { rdns: Vec::new() }
    }

    pub fn parse(text: &str) -> Result<Self, DnParseError> {
        if text.is_empty() {
            return Ok(Self::root());
        }
        let rdns = split_unescaped(text, ',')
            .iter()
            .map(|piece| RelativeDistinguishedName::parse(piece))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DistinguishedName { rdns })
    }

    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    /// The name with the outermost RDN removed (this name's parent).
    pub fn parent(&self) -> Option<DistinguishedName> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(DistinguishedName { rdns: self.rdns[1..].to_vec() })
        }
    }

    /// True when `other` is this name or an entry below it: popping RDNs from
    /// the tail of both sequences in lockstep never mismatches, and this
    /// sequence is exhausted no later than the other's.
    pub fn contains(&self, other: &DistinguishedName) -> bool {
        if self.rdns.len() > other.rdns.len() {
            return false;
        }
        self.rdns
            .iter()
            .rev()
            .zip(other.rdns.iter().rev())
            .all(|(a, b)| a == b)
    }

    /// Accumulate trailing single-valued `dc=` RDN values into a dotted
    /// domain name. Stops at the first RDN that is not a plain `dc`.
    pub fn domain_name(&self) -> Option<String> {
        let mut labels = Vec::new();
        for rdn in self.rdns.iter().rev() {
            match rdn.components.as_slice() {
                [single] if single.attribute_type.eq_ignore_ascii_case("dc") => {
                    labels.push(single.value.clone());
                }
                _ => break,
            }
        }
        if labels.is_empty() {
            None
        } else {
            labels.reverse();
            Some(labels.join("."))
        }
    }
}

impl FromStr for DistinguishedName {
    type Err = DnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DistinguishedName::parse(s)
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.rdns.iter().map(|r| r.to_string()).collect();
        f.write_str(&rendered.join(","))
    }
}
