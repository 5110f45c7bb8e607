//! LDAP client: connection state machine, outstanding-request correlation,
//! and the async connection actor.
//!
//! The protocol logic lives in [`ClientConn`], which owns the receive buffer,
//! the monotonic message-id counter and the id -> handler table, and never
//! touches a socket. [`LdapClient`] wraps it in a tokio task that owns the
//! stream; one task per connection, so no state is ever shared across
//! threads. Pipelining is allowed: requests are distinguished purely by
//! message id, never by scheduling order.

use std::collections::hash_map::Entry as HashEntry;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::LdapError;
use crate::proto::{
    try_read_message, BindRequest, Control, ExtendedRequest, ExtendedResponse, LdapMessage,
    LdapResult, ParseOutcome, PasswordModifyRequest, ProtocolOp, SearchRequest,
    SearchResultEntry, PASSWORD_MODIFY_OID, STARTTLS_OID,
};

/// Connection lifecycle. `Anonymous` is the just-connected state; `Bound` is
/// reachable only through a successful Bind response, and Unbind or
/// connection loss returns to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Anonymous,
    Bound,
}

/// Callback for one message of a multi-response operation. Must return `true`
/// exactly on the final invocation.
pub type MultiHandler = Box<dyn FnMut(&LdapMessage) -> bool + Send>;

/// Callback for unsolicited notifications (message id 0).
pub type UnsolicitedHandler = Box<dyn FnMut(LdapMessage) + Send>;

/// A registered completion for one outstanding message id.
pub enum Pending {
    /// Single-response operation: resolved with the one response.
    Single(oneshot::Sender<Result<LdapMessage, LdapError>>),
    /// 0..N partial responses then exactly one final: `handler` sees each
    /// message, `done` resolves when it reports completion.
    Multi {
        handler: MultiHandler,
        done: oneshot::Sender<Result<(), LdapError>>,
    },
}

fn fail_pending(pending: Pending, error: LdapError) {
    match pending {
        Pending::Single(tx) => {
            let _ = tx.send(Err(error));
        }
        Pending::Multi { done, .. } => {
            let _ = done.send(Err(error));
        }
    }
}

/// The pure per-connection state machine.
pub struct ClientConn {
    state: ConnectionState,
    next_id: i32,
    outstanding: HashMap<i32, Pending>,
    buffer: BytesMut,
    unsolicited: Option<UnsolicitedHandler>,
}

impl ClientConn {
    pub fn new() -> Self {
        Self::with_first_id(1)
    }

    /// Start the id counter at a chosen value, for deterministic tests.
    pub fn with_first_id(first_id: i32) -> Self {
        ClientConn {
            state: ConnectionState::Anonymous,
            next_id: first_id,
            outstanding: HashMap::new(),
            buffer: BytesMut::with_capacity(4096),
            unsolicited: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn has_outstanding(&self) -> bool {
        !self.outstanding.is_empty()
    }

    pub fn set_unsolicited_handler(&mut self, handler: UnsolicitedHandler) {
        self.unsolicited = Some(handler);
    }

    /// Allocate a message id and encode the message. Fails immediately with a
    /// connection-lost error when the connection is gone; nothing touches the
    /// network in that case.
    pub fn prepare(
        &mut self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
    ) -> Result<(i32, Vec<u8>), LdapError> {
        if self.state == ConnectionState::Disconnected {
            return Err(LdapError::ConnectionLost);
        }
        let id = self.next_id;
        self.next_id += 1;
        let message = LdapMessage { id, op, controls };
        Ok((id, message.to_bytes()))
    }

    /// Register the completion for a prepared request. Ids are monotonic and
    /// never reused while a request is pending, so an id can be registered at
    /// most once.
    pub fn register(&mut self, id: i32, pending: Pending) {
        let previous = self.outstanding.insert(id, pending);
        debug_assert!(previous.is_none(), "message id {} registered twice", id);
    }

    /// Buffer received bytes and dispatch every complete message. Partial
    /// bytes stay buffered for the next call. An error means the stream is no
    /// longer trustworthy and the connection must be torn down.
    pub fn data_received(&mut self, data: &[u8]) -> Result<(), LdapError> {
        self.buffer.extend_from_slice(data);
        loop {
            match try_read_message(&mut self.buffer)? {
                ParseOutcome::Incomplete => return Ok(()),
                ParseOutcome::Invalid { error, .. } => return Err(error),
                ParseOutcome::Message(parsed) => self.handle(parsed.message)?,
            }
        }
    }

    /// Route one decoded message: id 0 to the unsolicited-notification
    /// callback, anything else to its registered handler.
    fn handle(&mut self, message: LdapMessage) -> Result<(), LdapError> {
        if message.id == 0 {
            debug!("unsolicited notification: {}", message.op.name());
            if let Some(handler) = &mut self.unsolicited {
                handler(message);
            }
            return Ok(());
        }
        let is_final = message.op.is_final_response();
        match self.outstanding.entry(message.id) {
            HashEntry::Vacant(_) => Err(LdapError::Protocol(format!(
                "response for unknown message id {}",
                message.id
            ))),
            HashEntry::Occupied(mut entry) => match entry.get_mut() {
                Pending::Single(_) => {
                    if let ProtocolOp::BindResponse(resp) = &message.op {
                        if resp.result.is_success() {
                            self.state = ConnectionState::Bound;
                        }
                    }
                    let Pending::Single(tx) = entry.remove() else { unreachable!() };
                    let _ = tx.send(Ok(message));
                    Ok(())
                }
                Pending::Multi { handler, .. } => {
                    let done_flag = handler(&message);
                    // The handler must report done exactly on the final
                    // response, no earlier and no later.
                    if done_flag != is_final {
                        entry.remove();
                        return Err(LdapError::Protocol(format!(
                            "multi-response handler contract violated on {}",
                            message.op.name()
                        )));
                    }
                    if done_flag {
                        let Pending::Multi { done, .. } = entry.remove() else { unreachable!() };
                        let _ = done.send(Ok(()));
                    }
                    Ok(())
                }
            },
        }
    }

    /// Fail every outstanding handler with a connection-lost error and mark
    /// the connection disconnected. The only cancellation primitive.
    pub fn connection_lost(&mut self) {
        self.state = ConnectionState::Disconnected;
        for (_, pending) in self.outstanding.drain() {
            fail_pending(pending, LdapError::ConnectionLost);
        }
    }
}

impl Default for ClientConn {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side stream: plain TCP or TLS after a StartTLS upgrade.
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

enum Command {
    Send {
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
        pending: Option<Pending>,
    },
    StartTls {
        config: Arc<rustls::ClientConfig>,
        server_name: String,
        done: oneshot::Sender<Result<(), LdapError>>,
    },
}

/// Handle to one client connection. Cheap to clone; all clones talk to the
/// same connection task. When the task exits (unbind, connection loss), every
/// call fails immediately with a connection-lost error.
#[derive(Clone)]
pub struct LdapClient {
    tx: mpsc::UnboundedSender<Command>,
}

impl LdapClient {
    /// Connect over TCP and spawn the connection task.
    pub async fn connect(addr: &str) -> Result<Self, LdapError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    /// Adopt an established stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self::spawn(ClientStream::Tcp(stream), ClientConn::new())
    }

    /// Adopt an established stream with a chosen first message id, for
    /// deterministic tests.
    pub fn from_stream_with_first_id(stream: TcpStream, first_id: i32) -> Self {
        Self::spawn(ClientStream::Tcp(stream), ClientConn::with_first_id(first_id))
    }

    fn spawn(stream: ClientStream, conn: ClientConn) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(stream, conn, rx));
        LdapClient { tx }
    }

    fn submit(&self, command: Command) -> Result<(), LdapError> {
        self.tx.send(command).map_err(|_| LdapError::ConnectionLost)
    }

    /// Send a single-response operation and wait for its response message.
    pub async fn request(
        &self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
    ) -> Result<LdapMessage, LdapError> {
        if !op.needs_answer() {
            return Err(LdapError::Protocol(format!(
                "{} expects no answer",
                op.name()
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Send { op, controls, pending: Some(Pending::Single(tx)) })?;
        rx.await.map_err(|_| LdapError::ConnectionLost)?
    }

    /// Send a single-response operation and return the response operation.
    pub async fn send(&self, op: ProtocolOp) -> Result<ProtocolOp, LdapError> {
        Ok(self.request(op, None).await?.op)
    }

    /// Send an operation with 0..N partial responses followed by exactly one
    /// final response. `handler` is invoked once per received message and
    /// must return `true` exactly on the final invocation; the returned
    /// future resolves when it does.
    pub async fn send_multi<F>(
        &self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
        handler: F,
    ) -> Result<(), LdapError>
    where
        F: FnMut(&LdapMessage) -> bool + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        self.submit(Command::Send {
            op,
            controls,
            pending: Some(Pending::Multi { handler: Box::new(handler), done }),
        })?;
        rx.await.map_err(|_| LdapError::ConnectionLost)?
    }

    /// Simple bind. Resolves with `(matched_dn, server_sasl_creds)` from the
    /// matching BindResponse, or the response's error code.
    pub async fn bind(
        &self,
        dn: &str,
        password: &[u8],
    ) -> Result<(String, Option<Vec<u8>>), LdapError> {
        let response = self
            .send(ProtocolOp::BindRequest(BindRequest::simple(dn, password)))
            .await?;
        match response {
            ProtocolOp::BindResponse(resp) => {
                if resp.result.is_success() {
                    Ok((resp.result.matched_dn, resp.server_sasl_creds))
                } else {
                    Err(resp.result.into_error())
                }
            }
            other => Err(LdapError::Protocol(format!(
                "expected BindResponse, got {}",
                other.name()
            ))),
        }
    }

    /// Run a search, collecting entries until the final SearchResultDone.
    pub async fn search(
        &self,
        request: SearchRequest,
    ) -> Result<(Vec<SearchResultEntry>, LdapResult), LdapError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.send_multi(ProtocolOp::SearchRequest(request), None, move |message| {
            let done = message.op.is_final_response();
            let _ = tx.send(message.op.clone());
            done
        })
        .await?;
        let mut entries = Vec::new();
        let mut result = None;
        while let Ok(op) = rx.try_recv() {
            match op {
                ProtocolOp::SearchResultEntry(entry) => entries.push(entry),
                ProtocolOp::SearchResultDone(done) => result = Some(done),
                other => {
                    return Err(LdapError::Protocol(format!(
                        "unexpected {} in search results",
                        other.name()
                    )))
                }
            }
        }
        let result = result
            .ok_or_else(|| LdapError::Protocol("search completed without Done".to_string()))?;
        Ok((entries, result))
    }

    /// Send an extended request and return its response.
    pub async fn extended(
        &self,
        name: &str,
        value: Option<Vec<u8>>,
    ) -> Result<ExtendedResponse, LdapError> {
        let response = self
            .send(ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: name.to_string(),
                request_value: value,
            }))
            .await?;
        match response {
            ProtocolOp::ExtendedResponse(resp) => Ok(resp),
            other => Err(LdapError::Protocol(format!(
                "expected ExtendedResponse, got {}",
                other.name()
            ))),
        }
    }

    /// Password Modify extended operation (RFC 3062).
    pub async fn password_modify(
        &self,
        user_identity: Option<&str>,
        old_passwd: Option<&[u8]>,
        new_passwd: Option<&[u8]>,
    ) -> Result<(), LdapError> {
        let payload = PasswordModifyRequest {
            user_identity: user_identity.map(str::to_string),
            old_passwd: old_passwd.map(<[u8]>::to_vec),
            new_passwd: new_passwd.map(<[u8]>::to_vec),
        };
        let response = self
            .extended(PASSWORD_MODIFY_OID, Some(payload.to_value()))
            .await?;
        if response.result.is_success() {
            Ok(())
        } else {
            Err(response.result.into_error())
        }
    }

    /// Upgrade the connection to TLS in place. Must not be issued while any
    /// other request is outstanding: the connection task defers the send by
    /// one scheduling tick and then fails with a busy error if requests
    /// remain outstanding.
    pub async fn start_tls(
        &self,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<(), LdapError> {
        let (done, rx) = oneshot::channel();
        self.submit(Command::StartTls {
            config,
            server_name: server_name.to_string(),
            done,
        })?;
        rx.await.map_err(|_| LdapError::ConnectionLost)?
    }

    /// Send an UnbindRequest and close the connection. No response exists for
    /// Unbind, so this resolves as soon as the request is queued.
    pub fn unbind(&self) {
        let _ = self.submit(Command::Send {
            op: ProtocolOp::UnbindRequest,
            controls: None,
            pending: None,
        });
    }

    /// Abandon an outstanding operation by message id. No response follows.
    pub fn abandon(&self, id: i32) {
        let _ = self.submit(Command::Send {
            op: ProtocolOp::AbandonRequest(id),
            controls: None,
            pending: None,
        });
    }
}

/// The connection task: owns the stream and the state machine, multiplexes
/// between command submissions and received bytes.
async fn run_connection(
    mut stream: ClientStream,
    mut conn: ClientConn,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut read_buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                None => {
                    // Every handle dropped.
                    let _ = stream.shutdown().await;
                    conn.connection_lost();
                    return;
                }
                Some(Command::Send { op, controls, pending }) => {
                    let closes = matches!(op, ProtocolOp::UnbindRequest);
                    match conn.prepare(op, controls) {
                        Err(e) => {
                            if let Some(pending) = pending {
                                fail_pending(pending, e);
                            }
                        }
                        Ok((id, bytes)) => {
                            if let Some(pending) = pending {
                                conn.register(id, pending);
                            }
                            if let Err(e) = stream.write_all(&bytes).await {
                                warn!("write failed: {}", e);
                                conn.connection_lost();
                                return;
                            }
                            if closes {
                                let _ = stream.shutdown().await;
                                conn.connection_lost();
                                return;
                            }
                        }
                    }
                }
                Some(Command::StartTls { config, server_name, done }) => {
                    // One tick of deferral, so a handler dispatched just
                    // before this command has already cleared the table.
                    tokio::task::yield_now().await;
                    if conn.has_outstanding() {
                        let _ = done.send(Err(LdapError::StartTlsBusy));
                        continue;
                    }
                    if matches!(stream, ClientStream::Tls(_)) {
                        let _ = done.send(Err(LdapError::Protocol(
                            "TLS is already active on this connection".to_string(),
                        )));
                        continue;
                    }
                    match negotiate_start_tls(stream, &mut conn, config, server_name).await {
                        Ok(upgraded) => {
                            stream = upgraded;
                            let _ = done.send(Ok(()));
                        }
                        Err(e) => {
                            conn.connection_lost();
                            let _ = done.send(Err(e));
                            return;
                        }
                    }
                }
            },
            read = stream.read(&mut read_buf) => match read {
                Ok(0) => {
                    debug!("server closed the connection");
                    conn.connection_lost();
                    return;
                }
                Ok(n) => {
                    if let Err(e) = conn.data_received(&read_buf[..n]) {
                        warn!("tearing down connection: {}", e);
                        let _ = stream.shutdown().await;
                        conn.connection_lost();
                        return;
                    }
                }
                Err(e) => {
                    debug!("read failed: {}", e);
                    conn.connection_lost();
                    return;
                }
            },
        }
    }
}

/// Issue the StartTLS extended request, wait for its success response, then
/// wrap the socket. The outstanding table is empty here (checked by the
/// caller), so reading inline cannot starve other requests.
async fn negotiate_start_tls(
    stream: ClientStream,
    conn: &mut ClientConn,
    config: Arc<rustls::ClientConfig>,
    server_name: String,
) -> Result<ClientStream, LdapError> {
    let ClientStream::Tcp(mut tcp) = stream else {
        return Err(LdapError::Protocol("TLS is already active".to_string()));
    };
    let op = ProtocolOp::ExtendedRequest(ExtendedRequest {
        request_name: STARTTLS_OID.to_string(),
        request_value: None,
    });
    let (id, bytes) = conn.prepare(op, None)?;
    let (tx, mut rx) = oneshot::channel();
    conn.register(id, Pending::Single(tx));
    tcp.write_all(&bytes).await?;

    let mut read_buf = vec![0u8; 4096];
    let response = loop {
        match rx.try_recv() {
            Ok(response) => break response?,
            Err(oneshot::error::TryRecvError::Empty) => {}
            Err(oneshot::error::TryRecvError::Closed) => return Err(LdapError::ConnectionLost),
        }
        let n = tcp.read(&mut read_buf).await?;
        if n == 0 {
            conn.connection_lost();
            return Err(LdapError::ConnectionLost);
        }
        conn.data_received(&read_buf[..n])?;
    };
    match &response.op {
        ProtocolOp::ExtendedResponse(resp) if resp.result.is_success() => {}
        ProtocolOp::ExtendedResponse(resp) => return Err(resp.result.clone().into_error()),
        other => {
            return Err(LdapError::Protocol(format!(
                "expected ExtendedResponse to StartTLS, got {}",
                other.name()
            )))
        }
    }

    let name = rustls::pki_types::ServerName::try_from(server_name)
        .map_err(|_| LdapError::Protocol("invalid TLS server name".to_string()))?;
    let connector = TlsConnector::from(config);
    let tls = connector.connect(name, tcp).await?;
    debug!("StartTLS upgrade completed");
    Ok(ClientStream::Tls(tls))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;
    use crate::filter::Filter;
    use crate::proto::{BindResponse, DelRequest};
    use tokio::net::TcpListener;

    fn bind_response_bytes(id: i32, code: ResultCode) -> Vec<u8> {
        LdapMessage::new(
            id,
            ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::new(code, "", ""),
                server_sasl_creds: None,
            }),
        )
        .to_bytes()
    }

    #[test]
    fn test_ids_are_monotonic_and_unique() {
        let mut conn = ClientConn::new();
        let (a, _) = conn.prepare(ProtocolOp::UnbindRequest, None).unwrap();
        let (b, _) = conn.prepare(ProtocolOp::UnbindRequest, None).unwrap();
        let (c, _) = conn.prepare(ProtocolOp::UnbindRequest, None).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn test_prepare_fails_after_connection_lost() {
        let mut conn = ClientConn::new();
        conn.connection_lost();
        assert!(matches!(
            conn.prepare(ProtocolOp::UnbindRequest, None),
            Err(LdapError::ConnectionLost)
        ));
    }

    #[test]
    fn test_connection_lost_fails_outstanding_bind() {
        // A pending bind must resolve with connection-lost, not hang.
        let mut conn = ClientConn::new();
        let (id, _) = conn
            .prepare(ProtocolOp::BindRequest(BindRequest::simple("cn=x", "pw")), None)
            .unwrap();
        assert_eq!(id, 1);
        let (tx, mut rx) = oneshot::channel();
        conn.register(id, Pending::Single(tx));
        conn.connection_lost();
        match rx.try_recv().unwrap() {
            Err(LdapError::ConnectionLost) => {}
            other => panic!("expected ConnectionLost, got {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_single_response_dispatch_and_state() {
        let mut conn = ClientConn::new();
        let (id, _) = conn
            .prepare(ProtocolOp::BindRequest(BindRequest::simple("cn=x", "pw")), None)
            .unwrap();
        let (tx, mut rx) = oneshot::channel();
        conn.register(id, Pending::Single(tx));
        assert_eq!(conn.state(), ConnectionState::Anonymous);

        conn.data_received(&bind_response_bytes(id, ResultCode::Success)).unwrap();
        let message = rx.try_recv().unwrap().unwrap();
        assert!(matches!(message.op, ProtocolOp::BindResponse(_)));
        assert_eq!(conn.state(), ConnectionState::Bound);
        assert!(!conn.has_outstanding());
    }

    #[test]
    fn test_failed_bind_does_not_bind() {
        let mut conn = ClientConn::new();
        let (id, _) = conn
            .prepare(ProtocolOp::BindRequest(BindRequest::simple("cn=x", "pw")), None)
            .unwrap();
        let (tx, _rx) = oneshot::channel();
        conn.register(id, Pending::Single(tx));
        conn.data_received(&bind_response_bytes(id, ResultCode::InvalidCredentials)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Anonymous);
    }

    #[test]
    fn test_partial_bytes_stay_buffered() {
        let mut conn = ClientConn::new();
        let (id, _) = conn
            .prepare(ProtocolOp::BindRequest(BindRequest::simple("cn=x", "pw")), None)
            .unwrap();
        let (tx, mut rx) = oneshot::channel();
        conn.register(id, Pending::Single(tx));

        let bytes = bind_response_bytes(id, ResultCode::Success);
        let (head, tail) = bytes.split_at(3);
        conn.data_received(head).unwrap();
        assert!(rx.try_recv().is_err(), "partial message must not dispatch");
        conn.data_received(tail).unwrap();
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_unknown_id_is_protocol_error() {
        let mut conn = ClientConn::new();
        let err = conn
            .data_received(&bind_response_bytes(9, ResultCode::Success))
            .unwrap_err();
        assert!(matches!(err, LdapError::Protocol(_)));
    }

    #[test]
    fn test_unsolicited_notification_routing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = ClientConn::new();
        conn.set_unsolicited_handler(Box::new(move |message| {
            let _ = tx.send(message.id);
        }));
        // Id 0 goes to the callback even with requests outstanding.
        let (id, _) = conn
            .prepare(ProtocolOp::BindRequest(BindRequest::anonymous()), None)
            .unwrap();
        let (single, _keep) = oneshot::channel();
        conn.register(id, Pending::Single(single));
        conn.data_received(&bind_response_bytes(0, ResultCode::Unavailable)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), 0);
        assert!(conn.has_outstanding());
    }

    #[test]
    fn test_multi_response_contract() {
        let mut conn = ClientConn::new();
        let (id, _) = conn
            .prepare(
                ProtocolOp::SearchRequest(SearchRequest::subtree(
                    "dc=example,dc=com",
                    Filter::present("objectClass"),
                    vec![],
                )),
                None,
            )
            .unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let (done, mut done_rx) = oneshot::channel();
        conn.register(
            id,
            Pending::Multi {
                handler: Box::new(move |message| {
                    let _ = seen_tx.send(message.op.name());
                    message.op.is_final_response()
                }),
                done,
            },
        );

        let entry = LdapMessage::new(
            id,
            ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: "cn=a,dc=example,dc=com".into(),
                attributes: vec![],
            }),
        );
        conn.data_received(&entry.to_bytes()).unwrap();
        assert!(done_rx.try_recv().is_err(), "not done after a partial response");

        let done_msg = LdapMessage::new(id, ProtocolOp::SearchResultDone(LdapResult::success()));
        conn.data_received(&done_msg.to_bytes()).unwrap();
        assert!(done_rx.try_recv().unwrap().is_ok());
        assert!(!conn.has_outstanding());
        assert_eq!(seen_rx.try_recv().unwrap(), "SearchResultEntry");
        assert_eq!(seen_rx.try_recv().unwrap(), "SearchResultDone");

        // A further message for the completed id is unbalanced.
        let stray = LdapMessage::new(id, ProtocolOp::SearchResultDone(LdapResult::success()));
        assert!(conn.data_received(&stray.to_bytes()).is_err());
    }

    #[test]
    fn test_multi_handler_contract_is_checked() {
        // A handler claiming done on a partial response violates the
        // done-exactly-once contract.
        let mut conn = ClientConn::new();
        let (id, _) = conn
            .prepare(
                ProtocolOp::SearchRequest(SearchRequest::subtree(
                    "dc=example,dc=com",
                    Filter::present("objectClass"),
                    vec![],
                )),
                None,
            )
            .unwrap();
        let (done, _rx) = oneshot::channel();
        conn.register(
            id,
            Pending::Multi { handler: Box::new(|_| true), done },
        );
        let entry = LdapMessage::new(
            id,
            ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: "cn=a".into(),
                attributes: vec![],
            }),
        );
        assert!(conn.data_received(&entry.to_bytes()).is_err());
    }

    #[tokio::test]
    async fn test_bind_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let mut bytes = BytesMut::from(&buf[..n]);
            let ParseOutcome::Message(parsed) = try_read_message(&mut bytes).unwrap() else {
                panic!("expected one complete message");
            };
            assert!(matches!(parsed.message.op, ProtocolOp::BindRequest(_)));
            socket
                .write_all(&bind_response_bytes(parsed.message.id, ResultCode::Success))
                .await
                .unwrap();
        });

        let client = LdapClient::connect(&addr.to_string()).await.unwrap();
        let (matched_dn, creds) = client.bind("cn=admin,dc=example,dc=com", b"secret").await.unwrap();
        assert_eq!(matched_dn, "");
        assert!(creds.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_bind_fails_on_transport_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            // Read the bind request, then close without answering.
            let _ = socket.read(&mut buf).await.unwrap();
        });

        let client = LdapClient::connect(&addr.to_string()).await.unwrap();
        let err = client.bind("cn=admin,dc=example,dc=com", b"secret").await.unwrap_err();
        assert!(matches!(err, LdapError::ConnectionLost), "got {:?}", err);
        server.await.unwrap();

        // Later operations fail immediately without touching the network.
        let err = client.bind("cn=admin,dc=example,dc=com", b"secret").await.unwrap_err();
        assert!(matches!(err, LdapError::ConnectionLost));
    }

    #[tokio::test]
    async fn test_search_streams_entries_then_done() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let mut bytes = BytesMut::from(&buf[..n]);
            let ParseOutcome::Message(parsed) = try_read_message(&mut bytes).unwrap() else {
                panic!("expected one complete message");
            };
            let id = parsed.message.id;
            for name in ["cn=a,dc=example,dc=com", "cn=b,dc=example,dc=com"] {
                let entry = LdapMessage::new(
                    id,
                    ProtocolOp::SearchResultEntry(SearchResultEntry {
                        object_name: name.into(),
                        attributes: vec![],
                    }),
                );
                socket.write_all(&entry.to_bytes()).await.unwrap();
            }
            let done = LdapMessage::new(id, ProtocolOp::SearchResultDone(LdapResult::success()));
            socket.write_all(&done.to_bytes()).await.unwrap();
        });

        let client = LdapClient::connect(&addr.to_string()).await.unwrap();
        let (entries, result) = client
            .search(SearchRequest::subtree(
                "dc=example,dc=com",
                Filter::present("objectClass"),
                vec![],
            ))
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(result.is_success());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_pipelined_requests_keep_distinct_ids() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::with_capacity(4096);
            let mut ids = Vec::new();
            let mut read_buf = vec![0u8; 4096];
            while ids.len() < 2 {
                let n = socket.read(&mut read_buf).await.unwrap();
                buf.extend_from_slice(&read_buf[..n]);
                while let ParseOutcome::Message(parsed) = try_read_message(&mut buf).unwrap() {
                    ids.push(parsed.message.id);
                }
            }
            assert_ne!(ids[0], ids[1], "pipelined requests must not share an id");
            // Answer in reverse order; correlation is by id, not arrival.
            for &id in ids.iter().rev() {
                let resp = LdapMessage::new(id, ProtocolOp::DelResponse(LdapResult::success()));
                socket.write_all(&resp.to_bytes()).await.unwrap();
            }
        });

        let client = LdapClient::connect(&addr.to_string()).await.unwrap();
        let first = client.send(ProtocolOp::DelRequest(DelRequest { entry: "cn=a".into() }));
        let second = client.send(ProtocolOp::DelRequest(DelRequest { entry: "cn=b".into() }));
        let (first, second) = tokio::join!(first, second);
        assert!(matches!(first.unwrap(), ProtocolOp::DelResponse(_)));
        assert!(matches!(second.unwrap(), ProtocolOp::DelResponse(_)));
        server.await.unwrap();
    }
}
