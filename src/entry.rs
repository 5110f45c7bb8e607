//! The directory-entry capability interface.
//!
//! The protocol core never implements storage: server-side handlers call this
//! trait, and whatever sits behind it (an in-memory tree, a database, another
//! directory) is an external collaborator. Tests use a small in-memory
//! implementation.

use async_trait::async_trait;

use crate::dn::DistinguishedName;
use crate::error::LdapError;
use crate::filter::Filter;
use crate::proto::{Attribute, SearchResultEntry, SearchScope};

/// One directory entry: a name and its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub dn: DistinguishedName,
    pub attributes: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: DistinguishedName, attributes: Vec<Attribute>) -> Self {
        Entry { dn, attributes }
    }

    /// All values of one attribute, matched case-insensitively.
    pub fn get(&self, attr_type: &str) -> Option<&[Vec<u8>]> {
        self.attributes
            .iter()
            .find(|a| a.attr_type.eq_ignore_ascii_case(attr_type))
            .map(|a| a.attr_values.as_slice())
    }

    /// First value of one attribute as UTF-8 text.
    pub fn get_text(&self, attr_type: &str) -> Option<&str> {
        self.get(attr_type)
            .and_then(|values| values.first())
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Restrict to the requested attributes; an empty request means all.
    pub fn select(&self, attributes: &[String]) -> Entry {
        if attributes.is_empty() {
            return self.clone();
        }
        Entry {
            dn: self.dn.clone(),
            attributes: self
                .attributes
                .iter()
                .filter(|a| {
                    attributes.iter().any(|want| want.eq_ignore_ascii_case(&a.attr_type))
                })
                .cloned()
                .collect(),
        }
    }

    pub fn to_search_entry(&self) -> SearchResultEntry {
        SearchResultEntry {
            object_name: self.dn.to_string(),
            attributes: self.attributes.clone(),
        }
    }
}

/// What a directory store must provide for the protocol core to serve it.
///
/// Every method returns an [`LdapError::Result`] with the appropriate result
/// code on failure (`noSuchObject`, `invalidCredentials`, ...), which the
/// server dispatch forwards to the client unchanged.
#[async_trait]
pub trait DirectoryBackend: Send + Sync {
    /// Entries under `base` matching `filter` within `scope`. A `size_limit`
    /// of zero means unlimited.
    async fn search(
        &self,
        base: &DistinguishedName,
        scope: SearchScope,
        filter: &Filter,
        attributes: &[String],
        size_limit: i32,
    ) -> Result<Vec<Entry>, LdapError>;

    /// One entry by name.
    async fn fetch(
        &self,
        dn: &DistinguishedName,
        attributes: &[String],
    ) -> Result<Entry, LdapError>;

    async fn add(&self, dn: &DistinguishedName, attributes: Vec<Attribute>)
        -> Result<(), LdapError>;

    async fn delete(&self, dn: &DistinguishedName) -> Result<(), LdapError>;

    async fn move_entry(
        &self,
        dn: &DistinguishedName,
        new_dn: &DistinguishedName,
    ) -> Result<(), LdapError>;

    /// Verify credentials; on success returns the bound entry.
    async fn bind(&self, dn: &DistinguishedName, password: &[u8]) -> Result<Entry, LdapError>;
}
