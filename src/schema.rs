//! RFC 4512 schema element descriptions.
//!
//! Parses the parenthesized description strings servers publish in their
//! subschema subentry (attribute types, object classes, syntaxes, matching
//! rules) into structured records, and renders them back. `parse(render(x))`
//! equals `x` modulo whitespace.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaParseError {
    #[error("description must be parenthesized")]
    NotParenthesized,

    #[error("unterminated quoted string")]
    UnterminatedQuote,

    #[error("missing oid at start of description")]
    MissingOid,

    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),

    #[error("keyword {0} is missing its argument")]
    MissingArgument(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Dollar,
    Quoted(String),
    Word(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>, SchemaParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '$' => {
                chars.next();
                tokens.push(Token::Dollar);
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => s.push(c),
                        None => return Err(SchemaParseError::UnterminatedQuote),
                    }
                }
                tokens.push(Token::Quoted(s));
            }
            _ => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '(' | ')' | '$' | '\'') {
                        break;
                    }
                    s.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(s));
            }
        }
    }
    Ok(tokens)
}

/// Cursor over the token stream inside the outer parens.
struct Cursor {
    tokens: Vec<Token>,
    position: usize,
}

impl Cursor {
    fn new(text: &str) -> Result<Self, SchemaParseError> {
        let mut tokens = tokenize(text)?;
        match (tokens.first(), tokens.last()) {
            (Some(Token::LParen), Some(Token::RParen)) => {
                tokens.pop();
                tokens.remove(0);
            }
            _ => return Err(SchemaParseError::NotParenthesized),
        }
        Ok(Cursor { tokens, position: 0 })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn word(&mut self, keyword: &'static str) -> Result<String, SchemaParseError> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w),
            _ => Err(SchemaParseError::MissingArgument(keyword)),
        }
    }

    fn quoted(&mut self, keyword: &'static str) -> Result<String, SchemaParseError> {
        match self.next() {
            Some(Token::Quoted(s)) => Ok(s),
            _ => Err(SchemaParseError::MissingArgument(keyword)),
        }
    }

    /// `'name'` or `( 'name' 'name' ... )`.
    fn qdescrs(&mut self, keyword: &'static str) -> Result<Vec<String>, SchemaParseError> {
        match self.next() {
            Some(Token::Quoted(s)) => Ok(vec![s]),
            Some(Token::LParen) => {
                let mut names = Vec::new();
                loop {
                    match self.next() {
                        Some(Token::Quoted(s)) => names.push(s),
                        Some(Token::RParen) => break,
                        _ => return Err(SchemaParseError::MissingArgument(keyword)),
                    }
                }
                Ok(names)
            }
            _ => Err(SchemaParseError::MissingArgument(keyword)),
        }
    }

    /// `oid` or `( oid $ oid ... )`.
    fn oids(&mut self, keyword: &'static str) -> Result<Vec<String>, SchemaParseError> {
        match self.next() {
            Some(Token::Word(w)) => Ok(vec![w]),
            Some(Token::LParen) => {
                let mut oids = Vec::new();
                loop {
                    match self.next() {
                        Some(Token::Word(w)) => oids.push(w),
                        Some(Token::Dollar) => continue,
                        Some(Token::RParen) => break,
                        _ => return Err(SchemaParseError::MissingArgument(keyword)),
                    }
                }
                Ok(oids)
            }
            _ => Err(SchemaParseError::MissingArgument(keyword)),
        }
    }
}

fn render_qdescrs(out: &mut String, keyword: &str, names: &[String]) {
    if names.is_empty() {
        return;
    }
    out.push_str(keyword);
    if names.len() == 1 {
        out.push_str(&format!(" '{}'", names[0]));
    } else {
        out.push_str(" (");
        for name in names {
            out.push_str(&format!(" '{}'", name));
        }
        out.push_str(" )");
    }
    out.push(' ');
}

fn render_oids(out: &mut String, keyword: &str, oids: &[String]) {
    if oids.is_empty() {
        return;
    }
    out.push_str(keyword);
    if oids.len() == 1 {
        out.push(' ');
        out.push_str(&oids[0]);
    } else {
        out.push_str(" ( ");
        out.push_str(&oids.join(" $ "));
        out.push_str(" )");
    }
    out.push(' ');
}

/// AttributeTypeDescription (RFC 4512 section 4.1.2).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttributeTypeDescription {
    pub oid: String,
    pub names: Vec<String>,
    pub desc: Option<String>,
    pub obsolete: bool,
    pub sup: Option<String>,
    pub equality: Option<String>,
    pub ordering: Option<String>,
    pub substr: Option<String>,
    /// Syntax OID, noise like `{32768}` length bounds included verbatim.
    pub syntax: Option<String>,
    pub single_value: bool,
    pub collective: bool,
    pub no_user_modification: bool,
    pub usage: Option<String>,
}

impl FromStr for AttributeTypeDescription {
    type Err = SchemaParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut cursor = Cursor::new(text)?;
        let oid = cursor.word("oid").map_err(|_| SchemaParseError::MissingOid)?;
        let mut desc = AttributeTypeDescription { oid, ..Default::default() };
        while let Some(token) = cursor.next() {
            let keyword = match token {
                Token::Word(w) => w,
                other => return Err(SchemaParseError::UnexpectedToken(format!("{:?}", other))),
            };
            match keyword.as_str() {
                "NAME" => desc.names = cursor.qdescrs("NAME")?,
                "DESC" => desc.desc = Some(cursor.quoted("DESC")?),
                "OBSOLETE" => desc.obsolete = true,
                "SUP" => desc.sup = Some(cursor.word("SUP")?),
                "EQUALITY" => desc.equality = Some(cursor.word("EQUALITY")?),
                "ORDERING" => desc.ordering = Some(cursor.word("ORDERING")?),
                "SUBSTR" => desc.substr = Some(cursor.word("SUBSTR")?),
                "SYNTAX" => desc.syntax = Some(cursor.word("SYNTAX")?),
                "SINGLE-VALUE" => desc.single_value = true,
                "COLLECTIVE" => desc.collective = true,
                "NO-USER-MODIFICATION" => desc.no_user_modification = true,
                "USAGE" => desc.usage = Some(cursor.word("USAGE")?),
                other => return Err(SchemaParseError::UnexpectedToken(other.to_string())),
            }
        }
        Ok(desc)
    }
}

impl fmt::Display for AttributeTypeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        out.push_str(&format!("( {} ", self.oid));
        render_qdescrs(&mut out, "NAME", &self.names);
        if let Some(desc) = &self.desc {
            out.push_str(&format!("DESC '{}' ", desc));
        }
        if self.obsolete {
            out.push_str("OBSOLETE ");
        }
        if let Some(sup) = &self.sup {
            out.push_str(&format!("SUP {} ", sup));
        }
        if let Some(equality) = &self.equality {
            out.push_str(&format!("EQUALITY {} ", equality));
        }
        if let Some(ordering) = &self.ordering {
            out.push_str(&format!("ORDERING {} ", ordering));
        }
        if let Some(substr) = &self.substr {
            out.push_str(&format!("SUBSTR {} ", substr));
        }
        if let Some(syntax) = &self.syntax {
            out.push_str(&format!("SYNTAX {} ", syntax));
        }
        if self.single_value {
            out.push_str("SINGLE-VALUE ");
        }
        if self.collective {
            out.push_str("COLLECTIVE ");
        }
        if self.no_user_modification {
            out.push_str("NO-USER-MODIFICATION ");
        }
        if let Some(usage) = &self.usage {
            out.push_str(&format!("USAGE {} ", usage));
        }
        out.push(')');
        f.write_str(&out)
    }
}

/// Kind of an object class. STRUCTURAL is the RFC 4512 default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectClassKind {
    Abstract,
    #[default]
    Structural,
    Auxiliary,
}

impl ObjectClassKind {
    fn keyword(self) -> &'static str {
        match self {
            ObjectClassKind::Abstract => "ABSTRACT",
            ObjectClassKind::Structural => "STRUCTURAL",
            ObjectClassKind::Auxiliary => "AUXILIARY",
        }
    }
}

/// ObjectClassDescription (RFC 4512 section 4.1.1).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectClassDescription {
    pub oid: String,
    pub names: Vec<String>,
    pub desc: Option<String>,
    pub obsolete: bool,
    pub sup: Vec<String>,
    pub kind: ObjectClassKind,
    pub must: Vec<String>,
    pub may: Vec<String>,
}

impl FromStr for ObjectClassDescription {
    type Err = SchemaParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut cursor = Cursor::new(text)?;
        let oid = cursor.word("oid").map_err(|_| SchemaParseError::MissingOid)?;
        let mut desc = ObjectClassDescription { oid, ..Default::default() };
        while let Some(token) = cursor.next() {
            let keyword = match token {
                Token::Word(w) => w,
                other => return Err(SchemaParseError::UnexpectedToken(format!("{:?}", other))),
            };
            match keyword.as_str() {
                "NAME" => desc.names = cursor.qdescrs("NAME")?,
                "DESC" => desc.desc = Some(cursor.quoted("DESC")?),
                "OBSOLETE" => desc.obsolete = true,
                "SUP" => desc.sup = cursor.oids("SUP")?,
                "ABSTRACT" => desc.kind = ObjectClassKind::Abstract,
                "STRUCTURAL" => desc.kind = ObjectClassKind::Structural,
                "AUXILIARY" => desc.kind = ObjectClassKind::Auxiliary,
                "MUST" => desc.must = cursor.oids("MUST")?,
                "MAY" => desc.may = cursor.oids("MAY")?,
                other => return Err(SchemaParseError::UnexpectedToken(other.to_string())),
            }
        }
        Ok(desc)
    }
}

impl fmt::Display for ObjectClassDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        out.push_str(&format!("( {} ", self.oid));
        render_qdescrs(&mut out, "NAME", &self.names);
        if let Some(desc) = &self.desc {
            out.push_str(&format!("DESC '{}' ", desc));
        }
        if self.obsolete {
            out.push_str("OBSOLETE ");
        }
        render_oids(&mut out, "SUP", &self.sup);
        out.push_str(self.kind.keyword());
        out.push(' ');
        render_oids(&mut out, "MUST", &self.must);
        render_oids(&mut out, "MAY", &self.may);
        out.push(')');
        f.write_str(&out)
    }
}

/// SyntaxDescription (RFC 4512 section 4.1.5).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyntaxDescription {
    pub oid: String,
    pub desc: Option<String>,
}

impl FromStr for SyntaxDescription {
    type Err = SchemaParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut cursor = Cursor::new(text)?;
        let oid = cursor.word("oid").map_err(|_| SchemaParseError::MissingOid)?;
        let mut desc = SyntaxDescription { oid, ..Default::default() };
        while let Some(token) = cursor.next() {
            let keyword = match token {
                Token::Word(w) => w,
                other => return Err(SchemaParseError::UnexpectedToken(format!("{:?}", other))),
            };
            match keyword.as_str() {
                "DESC" => desc.desc = Some(cursor.quoted("DESC")?),
                other => return Err(SchemaParseError::UnexpectedToken(other.to_string())),
            }
        }
        Ok(desc)
    }
}

impl fmt::Display for SyntaxDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        out.push_str(&format!("( {} ", self.oid));
        if let Some(desc) = &self.desc {
            out.push_str(&format!("DESC '{}' ", desc));
        }
        out.push(')');
        f.write_str(&out)
    }
}

/// MatchingRuleDescription (RFC 4512 section 4.1.3).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchingRuleDescription {
    pub oid: String,
    pub names: Vec<String>,
    pub desc: Option<String>,
    pub obsolete: bool,
    pub syntax: String,
}

impl FromStr for MatchingRuleDescription {
    type Err = SchemaParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut cursor = Cursor::new(text)?;
        let oid = cursor.word("oid").map_err(|_| SchemaParseError::MissingOid)?;
        let mut desc = MatchingRuleDescription { oid, ..Default::default() };
        while let Some(token) = cursor.next() {
            let keyword = match token {
                Token::Word(w) => w,
                other => return Err(SchemaParseError::UnexpectedToken(format!("{:?}", other))),
            };
            match keyword.as_str() {
                "NAME" => desc.names = cursor.qdescrs("NAME")?,
                "DESC" => desc.desc = Some(cursor.quoted("DESC")?),
                "OBSOLETE" => desc.obsolete = true,
                "SYNTAX" => desc.syntax = cursor.word("SYNTAX")?,
                other => return Err(SchemaParseError::UnexpectedToken(other.to_string())),
            }
        }
        Ok(desc)
    }
}

impl fmt::Display for MatchingRuleDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        out.push_str(&format!("( {} ", self.oid));
        render_qdescrs(&mut out, "NAME", &self.names);
        if let Some(desc) = &self.desc {
            out.push_str(&format!("DESC '{}' ", desc));
        }
        if self.obsolete {
            out.push_str("OBSOLETE ");
        }
        if !self.syntax.is_empty() {
            out.push_str(&format!("SYNTAX {} ", self.syntax));
        }
        out.push(')');
        f.write_str(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_type_full() {
        let text = "( 2.5.4.3 NAME ( 'cn' 'commonName' ) DESC 'RFC4519: common name' \
                    SUP name EQUALITY caseIgnoreMatch SUBSTR caseIgnoreSubstringsMatch \
                    SYNTAX 1.3.6.1.4.1.1466.115.121.1.15{32768} )";
        let at: AttributeTypeDescription = text.parse().unwrap();
        assert_eq!(at.oid, "2.5.4.3");
        assert_eq!(at.names, vec!["cn", "commonName"]);
        assert_eq!(at.desc.as_deref(), Some("RFC4519: common name"));
        assert_eq!(at.sup.as_deref(), Some("name"));
        assert_eq!(at.equality.as_deref(), Some("caseIgnoreMatch"));
        assert_eq!(at.syntax.as_deref(), Some("1.3.6.1.4.1.1466.115.121.1.15{32768}"));
        assert!(!at.single_value);
    }

    #[test]
    fn test_attribute_type_flags() {
        let text = "( 1.2.3 NAME 'x' OBSOLETE SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 \
                    SINGLE-VALUE NO-USER-MODIFICATION USAGE directoryOperation )";
        let at: AttributeTypeDescription = text.parse().unwrap();
        assert!(at.obsolete);
        assert!(at.single_value);
        assert!(at.no_user_modification);
        assert_eq!(at.usage.as_deref(), Some("directoryOperation"));
    }

    #[test]
    fn test_attribute_type_round_trip() {
        let texts = [
            "( 2.5.4.3 NAME ( 'cn' 'commonName' ) SUP name EQUALITY caseIgnoreMatch \
             SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )",
            "( 1.2.3 NAME 'x' DESC 'with desc' SINGLE-VALUE )",
            "( 1.2.4 )",
        ];
        for text in texts {
            let once: AttributeTypeDescription = text.parse().unwrap();
            let again: AttributeTypeDescription = once.to_string().parse().unwrap();
            assert_eq!(once, again, "round-trip changed {:?}", text);
        }
    }

    #[test]
    fn test_object_class_full() {
        let text = "( 2.5.6.6 NAME 'person' DESC 'RFC4519: a person' SUP top STRUCTURAL \
                    MUST ( sn $ cn ) MAY ( userPassword $ telephoneNumber $ seeAlso ) )";
        let oc: ObjectClassDescription = text.parse().unwrap();
        assert_eq!(oc.oid, "2.5.6.6");
        assert_eq!(oc.names, vec!["person"]);
        assert_eq!(oc.sup, vec!["top"]);
        assert_eq!(oc.kind, ObjectClassKind::Structural);
        assert_eq!(oc.must, vec!["sn", "cn"]);
        assert_eq!(oc.may, vec!["userPassword", "telephoneNumber", "seeAlso"]);
    }

    #[test]
    fn test_object_class_round_trip() {
        let texts = [
            "( 2.5.6.6 NAME 'person' SUP top STRUCTURAL MUST ( sn $ cn ) MAY userPassword )",
            "( 2.5.6.0 NAME 'top' ABSTRACT MUST objectClass )",
            "( 1.2.3 NAME 'aux' SUP ( a $ b ) AUXILIARY )",
        ];
        for text in texts {
            let once: ObjectClassDescription = text.parse().unwrap();
            let again: ObjectClassDescription = once.to_string().parse().unwrap();
            assert_eq!(once, again, "round-trip changed {:?}", text);
        }
    }

    #[test]
    fn test_syntax_description() {
        let text = "( 1.3.6.1.4.1.1466.115.121.1.15 DESC 'Directory String' )";
        let syn: SyntaxDescription = text.parse().unwrap();
        assert_eq!(syn.oid, "1.3.6.1.4.1.1466.115.121.1.15");
        assert_eq!(syn.desc.as_deref(), Some("Directory String"));
        let again: SyntaxDescription = syn.to_string().parse().unwrap();
        assert_eq!(syn, again);
    }

    #[test]
    fn test_matching_rule_description() {
        let text = "( 2.5.13.2 NAME 'caseIgnoreMatch' SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )";
        let mr: MatchingRuleDescription = text.parse().unwrap();
        assert_eq!(mr.oid, "2.5.13.2");
        assert_eq!(mr.names, vec!["caseIgnoreMatch"]);
        assert_eq!(mr.syntax, "1.3.6.1.4.1.1466.115.121.1.15");
        let again: MatchingRuleDescription = mr.to_string().parse().unwrap();
        assert_eq!(mr, again);
    }

    #[test]
    fn test_whitespace_is_normalized() {
        let sloppy = "(  2.5.6.0   NAME 'top'   ABSTRACT  MUST objectClass  )";
        let oc: ObjectClassDescription = sloppy.parse().unwrap();
        assert_eq!(oc.to_string(), "( 2.5.6.0 NAME 'top' ABSTRACT MUST objectClass )");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "2.5.6.0 NAME 'top'".parse::<ObjectClassDescription>(),
            Err(SchemaParseError::NotParenthesized)
        ));
        assert!(matches!(
            "( 1.2.3 DESC )".parse::<AttributeTypeDescription>(),
            Err(SchemaParseError::MissingArgument("DESC"))
        ));
        assert!(matches!(
            "( 1.2.3 NAME 'x' BOGUS )".parse::<AttributeTypeDescription>(),
            Err(SchemaParseError::UnexpectedToken(_))
        ));
        assert!(matches!(
            "( 1.2.3 DESC 'unterminated )".parse::<SyntaxDescription>(),
            Err(SchemaParseError::UnterminatedQuote)
        ));
    }
}
