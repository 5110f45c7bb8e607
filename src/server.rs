//! LDAP server: listener, per-connection loop, and request dispatch over a
//! [`DirectoryBackend`].
//!
//! Each connection runs in its own task with its own receive buffer. Messages
//! are processed in the order their bytes arrived; a handler may call `reply`
//! zero or more times (search sends one reply per matched entry and exactly
//! one terminal Done). StartTLS is handled at the transport layer here, not
//! in the dispatch, because it swaps the socket out from under the loop.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::dn::DistinguishedName;
use crate::entry::DirectoryBackend;
use crate::error::{LdapError, ResultCode};
use crate::proto::{
    error_response_for_tag, try_read_message, BindAuthentication, BindResponse, Control,
    ExtendedResponse, LdapMessage, LdapResult, ParseOutcome, ProtocolOp, SearchRequest,
    STARTTLS_OID, UNSUPPORTED_OPERATION_OID,
};

/// Server-side stream: plain TCP, or TLS after LDAPS accept or StartTLS.
pub enum ServerStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for ServerStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ServerStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ServerStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ServerStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ServerStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Parse `ldap://host:port` (or `ldaps://`) into a bindable address.
/// `ldap://:1389` binds all interfaces.
pub fn parse_listen_url(url: &str) -> Result<SocketAddr, LdapError> {
    let rest = url
        .strip_prefix("ldap://")
        .or_else(|| url.strip_prefix("ldaps://"))
        .ok_or_else(|| {
            LdapError::Protocol("invalid URL scheme, expected ldap:// or ldaps://".to_string())
        })?;
    let rest = rest.trim_start_matches('/');
    if let Some(port) = rest.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| LdapError::Protocol(format!("invalid port in {}", url)))?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        rest.parse()
            .map_err(|_| LdapError::Protocol(format!("failed to parse address {}", rest)))
    }
}

/// Per-connection session state.
#[derive(Debug, Default)]
pub struct Session {
    /// DN of a successful non-anonymous bind on this connection.
    pub bound_dn: Option<DistinguishedName>,
}

/// An LDAP server serving a directory backend.
pub struct LdapServer<B> {
    backend: Arc<B>,
    tls_acceptor: Option<TlsAcceptor>,
    /// Control OIDs whose critical presence does not fail the request.
    supported_controls: Vec<String>,
}

impl<B: DirectoryBackend + 'static> LdapServer<B> {
    pub fn new(backend: Arc<B>) -> Self {
        LdapServer { backend, tls_acceptor: None, supported_controls: Vec::new() }
    }

    /// Enable StartTLS with this acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn with_supported_controls(mut self, oids: Vec<String>) -> Self {
        self.supported_controls = oids;
        self
    }

    /// Accept loop: one spawned task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), LdapError> {
        info!("LDAP server listening on {}", listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("new connection from {}", peer_addr);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server
                            .handle_connection(ServerStream::Tcp(stream), peer_addr)
                            .await
                        {
                            error!("error handling client {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => error!("failed to accept connection: {}", e),
            }
        }
    }

    /// Serve one connection until Unbind, close, or framing corruption.
    pub async fn handle_connection(
        &self,
        mut stream: ServerStream,
        peer_addr: SocketAddr,
    ) -> Result<(), LdapError> {
        let mut buffer = BytesMut::with_capacity(4096);
        let mut read_buf = vec![0u8; 4096];
        let mut session = Session::default();

        loop {
            let n = match stream.read(&mut read_buf).await {
                Ok(0) => {
                    debug!("client {} disconnected", peer_addr);
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("read error from {}: {}", peer_addr, e);
                    return Ok(());
                }
            };
            buffer.extend_from_slice(&read_buf[..n]);

            loop {
                let parsed = match try_read_message(&mut buffer) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // Framing corruption: further decoding on this
                        // connection is unsafe. Answer what we can and close.
                        warn!("invalid LDAP framing from {}: {}", peer_addr, e);
                        let notice = LdapMessage::new(
                            0,
                            ProtocolOp::ExtendedResponse(ExtendedResponse {
                                result: LdapResult::new(
                                    ResultCode::ProtocolError,
                                    "",
                                    "invalid message framing",
                                ),
                                response_name: Some(UNSUPPORTED_OPERATION_OID.to_string()),
                                response_value: None,
                            }),
                        );
                        let _ = stream.write_all(&notice.to_bytes()).await;
                        let _ = stream.flush().await;
                        return Ok(());
                    }
                };
                match parsed {
                    ParseOutcome::Incomplete => break,
                    ParseOutcome::Invalid { id, tag, error } => {
                        warn!("unparseable request from {}: {}", peer_addr, error);
                        let op = error_response_for_tag(
                            tag,
                            LdapResult::new(ResultCode::ProtocolError, "", error.to_string()),
                        );
                        stream.write_all(&LdapMessage::new(id, op).to_bytes()).await?;
                        stream.flush().await?;
                    }
                    ParseOutcome::Message(parsed) => {
                        let message = parsed.message;
                        debug!(
                            "{} (msgid {}) from {}",
                            message.op.name(),
                            message.id,
                            peer_addr
                        );
                        match message.op {
                            ProtocolOp::UnbindRequest => {
                                // Closes the transport without any reply.
                                return Ok(());
                            }
                            ProtocolOp::AbandonRequest(abandoned) => {
                                debug!("abandon for msgid {} (no reply)", abandoned);
                                continue;
                            }
                            ProtocolOp::ExtendedRequest(ref req)
                                if req.request_name == STARTTLS_OID =>
                            {
                                stream = match self
                                    .start_tls(stream, message.id, peer_addr)
                                    .await?
                                {
                                    Some(upgraded) => upgraded,
                                    None => return Ok(()),
                                };
                                // The client must not pipeline past StartTLS;
                                // anything already buffered is discarded.
                                buffer.clear();
                                break;
                            }
                            op => {
                                let mut replies = Vec::new();
                                {
                                    let mut reply = |response: ProtocolOp| {
                                        replies.push(LdapMessage::new(message.id, response));
                                    };
                                    self.dispatch(
                                        &op,
                                        message.controls.as_deref(),
                                        &mut session,
                                        &mut reply,
                                    )
                                    .await;
                                }
                                for response in replies {
                                    stream.write_all(&response.to_bytes()).await?;
                                }
                                stream.flush().await?;
                            }
                        }
                    }
                }
            }
        }
    }

    /// StartTLS extended operation. Returns the upgraded stream, or None when
    /// the connection must close.
    async fn start_tls(
        &self,
        mut stream: ServerStream,
        message_id: i32,
        peer_addr: SocketAddr,
    ) -> Result<Option<ServerStream>, LdapError> {
        if matches!(stream, ServerStream::Tls(_)) {
            let response = extended_result(
                ResultCode::ProtocolError,
                "StartTLS not permitted on a secure connection",
            );
            stream.write_all(&LdapMessage::new(message_id, response).to_bytes()).await?;
            stream.flush().await?;
            return Ok(Some(stream));
        }
        let Some(acceptor) = &self.tls_acceptor else {
            let response =
                extended_result(ResultCode::UnwillingToPerform, "StartTLS not configured");
            stream.write_all(&LdapMessage::new(message_id, response).to_bytes()).await?;
            stream.flush().await?;
            return Ok(Some(stream));
        };
        let response = ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::success(),
            response_name: Some(STARTTLS_OID.to_string()),
            response_value: None,
        });
        stream.write_all(&LdapMessage::new(message_id, response).to_bytes()).await?;
        stream.flush().await?;
        let ServerStream::Tcp(tcp) = stream else { unreachable!("checked above") };
        match acceptor.accept(tcp).await {
            Ok(tls) => {
                debug!("StartTLS upgrade completed for {}", peer_addr);
                Ok(Some(ServerStream::Tls(tls)))
            }
            Err(e) => {
                error!("StartTLS handshake failed for {}: {}", peer_addr, e);
                Ok(None)
            }
        }
    }

    /// Dispatch one request. `reply` may be called zero or more times;
    /// search-style operations call it once per entry plus exactly one Done.
    pub async fn dispatch(
        &self,
        op: &ProtocolOp,
        controls: Option<&[Control]>,
        session: &mut Session,
        reply: &mut (dyn FnMut(ProtocolOp) + Send),
    ) {
        // An unsupported critical control fails the operation before the
        // handler runs; non-critical unsupported controls are ignored.
        if let Some(oid) = self.first_unsupported_critical(controls) {
            debug!("refusing unsupported critical control {}", oid);
            let result = LdapResult::new(
                ResultCode::UnavailableCriticalExtension,
                "",
                format!("critical control {} is not supported", oid),
            );
            reply(error_response_for_tag(Some(op.tag_number()), result));
            return;
        }

        match op {
            ProtocolOp::BindRequest(req) => {
                // The version gate runs before any credential handling, so an
                // unsupported version cannot probe whether a DN exists.
                if req.version != 3 {
                    reply(bind_result(LdapResult::new(
                        ResultCode::ProtocolError,
                        "",
                        format!("LDAP version {} is not supported, use 3", req.version),
                    )));
                    return;
                }
                match &req.authentication {
                    BindAuthentication::Sasl { mechanism, .. } => {
                        reply(bind_result(LdapResult::new(
                            ResultCode::AuthMethodNotSupported,
                            "",
                            format!("SASL mechanism {} is not supported", mechanism),
                        )));
                    }
                    BindAuthentication::Simple(password) => {
                        if req.name.is_empty() && password.is_empty() {
                            session.bound_dn = None;
                            reply(bind_result(LdapResult::success()));
                            return;
                        }
                        let dn = match DistinguishedName::parse(&req.name) {
                            Ok(dn) => dn,
                            Err(e) => {
                                reply(bind_result(LdapResult::new(
                                    ResultCode::InvalidDnSyntax,
                                    "",
                                    e.to_string(),
                                )));
                                return;
                            }
                        };
                        match self.backend.bind(&dn, password).await {
                            Ok(entry) => {
                                info!("bind successful for {}", entry.dn);
                                session.bound_dn = Some(entry.dn);
                                reply(bind_result(LdapResult::success()));
                            }
                            Err(e) => {
                                debug!("bind failed for {}: {}", dn, e);
                                reply(bind_result(result_from_error(e)));
                            }
                        }
                    }
                }
            }

            ProtocolOp::SearchRequest(req) => self.search(req, reply).await,

            ProtocolOp::AddRequest(req) => {
                let result = match DistinguishedName::parse(&req.entry) {
                    Err(e) => LdapResult::new(ResultCode::InvalidDnSyntax, "", e.to_string()),
                    Ok(dn) => match self.backend.add(&dn, req.attributes.clone()).await {
                        Ok(()) => LdapResult::success(),
                        Err(e) => result_from_error(e),
                    },
                };
                reply(ProtocolOp::AddResponse(result));
            }

            ProtocolOp::DelRequest(req) => {
                let result = match DistinguishedName::parse(&req.entry) {
                    Err(e) => LdapResult::new(ResultCode::InvalidDnSyntax, "", e.to_string()),
                    Ok(dn) => match self.backend.delete(&dn).await {
                        Ok(()) => LdapResult::success(),
                        Err(e) => result_from_error(e),
                    },
                };
                reply(ProtocolOp::DelResponse(result));
            }

            ProtocolOp::ModifyDNRequest(req) => {
                let result = self.modify_dn(req).await;
                reply(ProtocolOp::ModifyDNResponse(result));
            }

            ProtocolOp::ModifyRequest(_) => {
                // The backend capability interface carries no attribute
                // rewrite operation.
                reply(ProtocolOp::ModifyResponse(LdapResult::new(
                    ResultCode::UnwillingToPerform,
                    "",
                    "modify is not supported by this server",
                )));
            }

            ProtocolOp::ExtendedRequest(req) => {
                debug!("unsupported extended operation {}", req.request_name);
                reply(unsupported_operation());
            }

            other => {
                warn!("unsupported operation {}", other.name());
                reply(unsupported_operation());
            }
        }
    }

    async fn search(&self, req: &SearchRequest, reply: &mut (dyn FnMut(ProtocolOp) + Send)) {
        let base = match DistinguishedName::parse(&req.base_object) {
            Ok(dn) => dn,
            Err(e) => {
                reply(ProtocolOp::SearchResultDone(LdapResult::new(
                    ResultCode::InvalidDnSyntax,
                    "",
                    e.to_string(),
                )));
                return;
            }
        };
        match self
            .backend
            .search(&base, req.scope, &req.filter, &req.attributes, req.size_limit)
            .await
        {
            Ok(entries) => {
                let count = entries.len();
                for entry in entries {
                    reply(ProtocolOp::SearchResultEntry(
                        entry.select(&req.attributes).to_search_entry(),
                    ));
                }
                debug!("search under {} returned {} entries", base, count);
                reply(ProtocolOp::SearchResultDone(LdapResult::success()));
            }
            Err(e) => reply(ProtocolOp::SearchResultDone(result_from_error(e))),
        }
    }

    async fn modify_dn(&self, req: &crate::proto::ModifyDNRequest) -> LdapResult {
        let dn = match DistinguishedName::parse(&req.entry) {
            Ok(dn) => dn,
            Err(e) => return LdapResult::new(ResultCode::InvalidDnSyntax, "", e.to_string()),
        };
        let newrdn = match DistinguishedName::parse(&req.newrdn) {
            Ok(parsed) if parsed.rdns.len() == 1 => parsed.rdns.into_iter().next().unwrap(),
            Ok(_) => {
                return LdapResult::new(ResultCode::InvalidDnSyntax, "", "newrdn must be one RDN")
            }
            Err(e) => return LdapResult::new(ResultCode::InvalidDnSyntax, "", e.to_string()),
        };
        let parent = match &req.new_superior {
            Some(superior) => match DistinguishedName::parse(superior) {
                Ok(dn) => dn,
                Err(e) => return LdapResult::new(ResultCode::InvalidDnSyntax, "", e.to_string()),
            },
            None => match dn.parent() {
                Some(parent) => parent,
                None => {
                    return LdapResult::new(
                        ResultCode::UnwillingToPerform,
                        "",
                        "cannot rename the root entry",
                    )
                }
            },
        };
        let mut rdns = vec![newrdn];
        rdns.extend(parent.rdns);
        let new_dn = DistinguishedName::new(rdns);
        match self.backend.move_entry(&dn, &new_dn).await {
            Ok(()) => LdapResult::success(),
            Err(e) => result_from_error(e),
        }
    }

    fn first_unsupported_critical(&self, controls: Option<&[Control]>) -> Option<String> {
        controls?
            .iter()
            .find(|c| c.criticality && !self.supported_controls.iter().any(|s| s == &c.oid))
            .map(|c| c.oid.clone())
    }
}

fn bind_result(result: LdapResult) -> ProtocolOp {
    ProtocolOp::BindResponse(BindResponse { result, server_sasl_creds: None })
}

fn extended_result(code: ResultCode, message: &str) -> ProtocolOp {
    ProtocolOp::ExtendedResponse(ExtendedResponse::plain(LdapResult::new(code, "", message)))
}

/// The reply for an operation this server does not implement: a well-formed
/// ExtendedResponse, never a dropped connection.
fn unsupported_operation() -> ProtocolOp {
    ProtocolOp::ExtendedResponse(ExtendedResponse {
        result: LdapResult::new(ResultCode::ProtocolError, "", "unsupported operation"),
        response_name: Some(UNSUPPORTED_OPERATION_OID.to_string()),
        response_value: None,
    })
}

/// Map an error from the backend (or plumbing) to a response result.
fn result_from_error(error: LdapError) -> LdapResult {
    LdapResult::from_error(&error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::filter::Filter;
    use crate::proto::{Attribute, BindRequest, DelRequest, ModifyRequest, SearchScope};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// Minimal in-memory backend for dispatch tests.
    struct MemoryBackend {
        entries: Mutex<HashMap<String, (Entry, Vec<u8>)>>,
    }

    impl MemoryBackend {
        fn new() -> Self {
            MemoryBackend { entries: Mutex::new(HashMap::new()) }
        }

        async fn insert(&self, dn: &str, password: &[u8], attributes: Vec<Attribute>) {
            let dn = DistinguishedName::parse(dn).unwrap();
            let key = dn.to_string().to_lowercase();
            self.entries
                .lock()
                .await
                .insert(key, (Entry::new(dn, attributes), password.to_vec()));
        }
    }

    fn filter_matches(filter: &Filter, entry: &Entry) -> bool {
        match filter {
            Filter::Present { attribute } => entry.get(attribute).is_some(),
            Filter::Equality { attribute, value } => entry
                .get(attribute)
                .map(|values| {
                    values.iter().any(|v| {
                        std::str::from_utf8(v)
                            .map(|v| v.eq_ignore_ascii_case(value))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false),
            Filter::And(filters) => filters.iter().all(|f| filter_matches(f, entry)),
            Filter::Or(filters) => filters.iter().any(|f| filter_matches(f, entry)),
            Filter::Not(inner) => !filter_matches(inner, entry),
            _ => false,
        }
    }

    #[async_trait]
    impl DirectoryBackend for MemoryBackend {
        async fn search(
            &self,
            base: &DistinguishedName,
            scope: SearchScope,
            filter: &Filter,
            _attributes: &[String],
            size_limit: i32,
        ) -> Result<Vec<Entry>, LdapError> {
            let entries = self.entries.lock().await;
            let mut found: Vec<Entry> = entries
                .values()
                .filter(|(entry, _)| base.contains(&entry.dn))
                .filter(|(entry, _)| match scope {
                    SearchScope::BaseObject => entry.dn == *base,
                    SearchScope::SingleLevel => {
                        entry.dn.parent().map(|p| p == *base).unwrap_or(false)
                    }
                    SearchScope::WholeSubtree => true,
                })
                .filter(|(entry, _)| filter_matches(filter, entry))
                .map(|(entry, _)| entry.clone())
                .collect();
            found.sort_by_key(|e| e.dn.to_string());
            if size_limit > 0 {
                found.truncate(size_limit as usize);
            }
            Ok(found)
        }

        async fn fetch(
            &self,
            dn: &DistinguishedName,
            attributes: &[String],
        ) -> Result<Entry, LdapError> {
            let entries = self.entries.lock().await;
            entries
                .get(&dn.to_string().to_lowercase())
                .map(|(entry, _)| entry.select(attributes))
                .ok_or_else(|| LdapError::from_result(32, "no such object"))
        }

        async fn add(
            &self,
            dn: &DistinguishedName,
            attributes: Vec<Attribute>,
        ) -> Result<(), LdapError> {
            let mut entries = self.entries.lock().await;
            let key = dn.to_string().to_lowercase();
            if entries.contains_key(&key) {
                return Err(LdapError::from_result(68, "entry already exists"));
            }
            entries.insert(key, (Entry::new(dn.clone(), attributes), Vec::new()));
            Ok(())
        }

        async fn delete(&self, dn: &DistinguishedName) -> Result<(), LdapError> {
            let mut entries = self.entries.lock().await;
            entries
                .remove(&dn.to_string().to_lowercase())
                .map(|_| ())
                .ok_or_else(|| LdapError::from_result(32, "no such object"))
        }

        async fn move_entry(
            &self,
            dn: &DistinguishedName,
            new_dn: &DistinguishedName,
        ) -> Result<(), LdapError> {
            let mut entries = self.entries.lock().await;
            let (mut entry, password) = entries
                .remove(&dn.to_string().to_lowercase())
                .ok_or_else(|| LdapError::from_result(32, "no such object"))?;
            entry.dn = new_dn.clone();
            entries.insert(new_dn.to_string().to_lowercase(), (entry, password));
            Ok(())
        }

        async fn bind(
            &self,
            dn: &DistinguishedName,
            password: &[u8],
        ) -> Result<Entry, LdapError> {
            let entries = self.entries.lock().await;
            match entries.get(&dn.to_string().to_lowercase()) {
                Some((entry, stored)) if stored == password && !stored.is_empty() => {
                    Ok(entry.clone())
                }
                Some(_) => Err(LdapError::from_result(49, "invalid credentials")),
                None => Err(LdapError::from_result(49, "invalid credentials")),
            }
        }
    }

    async fn server_with_data() -> LdapServer<MemoryBackend> {
        let backend = MemoryBackend::new();
        backend
            .insert(
                "cn=admin,dc=example,dc=com",
                b"secret",
                vec![
                    Attribute::strings("cn", &["admin"]),
                    Attribute::strings("objectClass", &["person"]),
                ],
            )
            .await;
        backend
            .insert(
                "cn=user,dc=example,dc=com",
                b"hunter2",
                vec![
                    Attribute::strings("cn", &["user"]),
                    Attribute::strings("mail", &["user@example.com"]),
                    Attribute::strings("objectClass", &["person"]),
                ],
            )
            .await;
        LdapServer::new(Arc::new(backend))
    }

    async fn dispatch_collect(
        server: &LdapServer<MemoryBackend>,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
    ) -> Vec<ProtocolOp> {
        let mut session = Session::default();
        let mut replies = Vec::new();
        let mut reply = |response: ProtocolOp| replies.push(response);
        server.dispatch(&op, controls.as_deref(), &mut session, &mut reply).await;
        replies
    }

    #[tokio::test]
    async fn test_bind_success_and_failure() {
        let server = server_with_data().await;
        let replies = dispatch_collect(
            &server,
            ProtocolOp::BindRequest(BindRequest::simple("cn=admin,dc=example,dc=com", "secret")),
            None,
        )
        .await;
        let [ProtocolOp::BindResponse(resp)] = replies.as_slice() else {
            panic!("expected one bind response");
        };
        assert!(resp.result.is_success());

        let replies = dispatch_collect(
            &server,
            ProtocolOp::BindRequest(BindRequest::simple("cn=admin,dc=example,dc=com", "wrong")),
            None,
        )
        .await;
        let [ProtocolOp::BindResponse(resp)] = replies.as_slice() else {
            panic!("expected one bind response");
        };
        assert_eq!(resp.result.result_code, ResultCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_bind_version_check_precedes_credentials() {
        let server = server_with_data().await;
        let mut request = BindRequest::simple("cn=missing,dc=example,dc=com", "whatever");
        request.version = 2;
        let replies = dispatch_collect(&server, ProtocolOp::BindRequest(request), None).await;
        let [ProtocolOp::BindResponse(resp)] = replies.as_slice() else {
            panic!("expected one bind response");
        };
        // protocolError naming the version, not invalidCredentials: the
        // version gate must not leak whether the DN exists.
        assert_eq!(resp.result.result_code, ResultCode::ProtocolError);
        assert!(resp.result.diagnostic_message.contains('2'));
    }

    #[tokio::test]
    async fn test_anonymous_bind() {
        let server = server_with_data().await;
        let replies =
            dispatch_collect(&server, ProtocolOp::BindRequest(BindRequest::anonymous()), None)
                .await;
        let [ProtocolOp::BindResponse(resp)] = replies.as_slice() else {
            panic!("expected one bind response");
        };
        assert!(resp.result.is_success());
    }

    #[tokio::test]
    async fn test_search_entries_then_exactly_one_done() {
        let server = server_with_data().await;
        let replies = dispatch_collect(
            &server,
            ProtocolOp::SearchRequest(SearchRequest::subtree(
                "dc=example,dc=com",
                Filter::present("objectClass"),
                vec![],
            )),
            None,
        )
        .await;
        assert_eq!(replies.len(), 3);
        assert!(matches!(replies[0], ProtocolOp::SearchResultEntry(_)));
        assert!(matches!(replies[1], ProtocolOp::SearchResultEntry(_)));
        let ProtocolOp::SearchResultDone(done) = &replies[2] else {
            panic!("expected terminal Done");
        };
        assert!(done.is_success());
    }

    #[tokio::test]
    async fn test_search_attribute_selection() {
        let server = server_with_data().await;
        let replies = dispatch_collect(
            &server,
            ProtocolOp::SearchRequest(SearchRequest::subtree(
                "dc=example,dc=com",
                Filter::equality("cn", "user"),
                vec!["mail".to_string()],
            )),
            None,
        )
        .await;
        let [ProtocolOp::SearchResultEntry(entry), ProtocolOp::SearchResultDone(_)] =
            replies.as_slice()
        else {
            panic!("expected one entry and Done");
        };
        assert_eq!(entry.attributes.len(), 1);
        assert_eq!(entry.attributes[0].attr_type, "mail");
    }

    #[tokio::test]
    async fn test_add_delete_modify_dn() {
        let server = server_with_data().await;
        let replies = dispatch_collect(
            &server,
            ProtocolOp::AddRequest(crate::proto::AddRequest {
                entry: "cn=new,dc=example,dc=com".into(),
                attributes: vec![Attribute::strings("cn", &["new"])],
            }),
            None,
        )
        .await;
        assert!(matches!(
            replies.as_slice(),
            [ProtocolOp::AddResponse(r)] if r.is_success()
        ));

        let replies = dispatch_collect(
            &server,
            ProtocolOp::ModifyDNRequest(crate::proto::ModifyDNRequest {
                entry: "cn=new,dc=example,dc=com".into(),
                newrdn: "cn=renamed".into(),
                delete_old_rdn: true,
                new_superior: None,
            }),
            None,
        )
        .await;
        assert!(matches!(
            replies.as_slice(),
            [ProtocolOp::ModifyDNResponse(r)] if r.is_success()
        ));

        let replies = dispatch_collect(
            &server,
            ProtocolOp::DelRequest(DelRequest { entry: "cn=renamed,dc=example,dc=com".into() }),
            None,
        )
        .await;
        assert!(matches!(
            replies.as_slice(),
            [ProtocolOp::DelResponse(r)] if r.is_success()
        ));

        let replies = dispatch_collect(
            &server,
            ProtocolOp::DelRequest(DelRequest { entry: "cn=renamed,dc=example,dc=com".into() }),
            None,
        )
        .await;
        assert!(matches!(
            replies.as_slice(),
            [ProtocolOp::DelResponse(r)] if r.result_code == ResultCode::NoSuchObject
        ));
    }

    #[tokio::test]
    async fn test_backend_fetch() {
        let server = server_with_data().await;
        let dn = DistinguishedName::parse("cn=user,dc=example,dc=com").unwrap();
        let entry = server.backend.fetch(&dn, &["mail".to_string()]).await.unwrap();
        assert_eq!(entry.attributes.len(), 1);
        assert_eq!(entry.get_text("mail"), Some("user@example.com"));

        let missing = DistinguishedName::parse("cn=nobody,dc=example,dc=com").unwrap();
        let err = server.backend.fetch(&missing, &[]).await.unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::NoSuchObject));
    }

    #[tokio::test]
    async fn test_unsupported_operation_reply() {
        let server = server_with_data().await;
        let replies =
            dispatch_collect(&server, ProtocolOp::ModifyResponse(LdapResult::success()), None)
                .await;
        let [ProtocolOp::ExtendedResponse(resp)] = replies.as_slice() else {
            panic!("expected extended response");
        };
        assert_eq!(resp.result.result_code, ResultCode::ProtocolError);
        assert_eq!(resp.response_name.as_deref(), Some(UNSUPPORTED_OPERATION_OID));
    }

    #[tokio::test]
    async fn test_modify_is_refused() {
        let server = server_with_data().await;
        let replies = dispatch_collect(
            &server,
            ProtocolOp::ModifyRequest(ModifyRequest {
                object: "cn=user,dc=example,dc=com".into(),
                changes: vec![],
            }),
            None,
        )
        .await;
        assert!(matches!(
            replies.as_slice(),
            [ProtocolOp::ModifyResponse(r)] if r.result_code == ResultCode::UnwillingToPerform
        ));
    }

    #[tokio::test]
    async fn test_critical_control_gate() {
        let server = server_with_data().await;
        // Critical and unsupported: refused before the handler runs.
        let replies = dispatch_collect(
            &server,
            ProtocolOp::SearchRequest(SearchRequest::subtree(
                "dc=example,dc=com",
                Filter::present("objectClass"),
                vec![],
            )),
            Some(vec![Control::new("1.2.3.4.5", true, None)]),
        )
        .await;
        let [ProtocolOp::SearchResultDone(done)] = replies.as_slice() else {
            panic!("expected only the refusing Done");
        };
        assert_eq!(done.result_code, ResultCode::UnavailableCriticalExtension);

        // Same control non-critical: ignored, operation proceeds.
        let replies = dispatch_collect(
            &server,
            ProtocolOp::SearchRequest(SearchRequest::subtree(
                "dc=example,dc=com",
                Filter::present("objectClass"),
                vec![],
            )),
            Some(vec![Control::new("1.2.3.4.5", false, None)]),
        )
        .await;
        assert_eq!(replies.len(), 3);
    }

    #[tokio::test]
    async fn test_unbind_closes_without_reply() {
        let server = Arc::new(server_with_data().await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::clone(&server);
        tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.unwrap();
            let _ = srv.handle_connection(ServerStream::Tcp(socket), peer).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&LdapMessage::new(1, ProtocolOp::UnbindRequest).to_bytes())
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        // The server must close without sending anything.
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_full_connection_over_socket() {
        let server = Arc::new(server_with_data().await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::clone(&server);
        tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.unwrap();
            let _ = srv.handle_connection(ServerStream::Tcp(socket), peer).await;
        });

        let client = crate::client::LdapClient::connect(&addr.to_string()).await.unwrap();
        let (matched, _) = client.bind("cn=admin,dc=example,dc=com", b"secret").await.unwrap();
        assert_eq!(matched, "");
        let (entries, result) = client
            .search(SearchRequest::subtree(
                "dc=example,dc=com",
                Filter::equality("cn", "user"),
                vec![],
            ))
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].object_name, "cn=user,dc=example,dc=com");
    }

    #[test]
    fn test_parse_listen_url() {
        let addr = parse_listen_url("ldap://127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        let addr = parse_listen_url("ldap://:1389").unwrap();
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
        let addr = parse_listen_url("ldaps:///127.0.0.1:636").unwrap();
        assert_eq!(addr.port(), 636);
        assert!(parse_listen_url("http://127.0.0.1:80").is_err());
        assert!(parse_listen_url("ldap://:99999").is_err());
    }
}
