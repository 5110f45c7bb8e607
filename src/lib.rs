//! LDAP protocol engine: a BER codec with chained decoder contexts, the
//! LDAP message layer, distinguished-name and filter models, client and
//! server state machines, and proxy/merger roles that relay client requests
//! to one or several backend directory servers.

pub mod ber;
pub mod client;
pub mod config;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;
pub mod merger;
pub mod proto;
pub mod proxy;
pub mod schema;
pub mod server;
pub mod service_bind;
pub mod tls;

pub use client::LdapClient;
pub use config::Config;
pub use dn::DistinguishedName;
pub use error::{LdapError, ResultCode};
pub use filter::{parse_filter, Filter};
pub use merger::Merger;
pub use proto::{LdapMessage, ProtocolOp};
pub use proxy::Proxy;
pub use server::LdapServer;
pub use service_bind::ServiceBindingProxy;
