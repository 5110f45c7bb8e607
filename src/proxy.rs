//! Single-backend proxy: relays client requests to one backend server and
//! backend responses back, with hooks for request/response rewriting.
//!
//! Incoming requests queue until the backend connection is established (and,
//! when configured, StartTLS toward the backend has completed); if the
//! backend never comes up, every queued request is answered with an
//! `unavailable`-class response rather than left hanging. Forwarding is
//! verbatim by default; [`ProxyHooks`] implementations may rewrite requests,
//! rewrite responses, answer locally, or drop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::client::LdapClient;
use crate::error::{LdapError, ResultCode};
use crate::proto::{
    error_response_for_tag, try_read_message, LdapMessage, LdapResult, ParseOutcome, ProtocolOp,
};

/// TLS settings for the backend leg: StartTLS is negotiated against the
/// backend before any client request is forwarded.
#[derive(Clone)]
pub struct BackendTls {
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: String,
}

/// Hooks a proxy variant may use to transform traffic. Both default to
/// passthrough.
#[async_trait]
pub trait ProxyHooks: Send + Sync {
    /// Called before a request is forwarded. The backend handle is available
    /// for hooks that need their own backend operations.
    async fn before_forward(
        &self,
        backend: &LdapClient,
        message: LdapMessage,
    ) -> Result<ForwardAction, LdapError> {
        let _ = backend;
        Ok(ForwardAction::Forward(message))
    }

    /// Called on each backend response before it is relayed to the client.
    async fn after_backend_response(
        &self,
        response: LdapMessage,
        request: &LdapMessage,
    ) -> Result<LdapMessage, LdapError> {
        let _ = request;
        Ok(response)
    }
}

/// The default hook set: forward everything unchanged.
pub struct PassthroughHooks;

#[async_trait]
impl ProxyHooks for PassthroughHooks {}

/// What to do with an intercepted request.
pub enum ForwardAction {
    /// Send this (possibly rewritten) request to the backend.
    Forward(LdapMessage),
    /// Answer the client directly; the backend is not contacted.
    Respond(Vec<ProtocolOp>),
    /// Silently discard the request.
    Drop,
}

/// A proxy with one backend per client connection.
pub struct Proxy<H> {
    backend_addr: String,
    backend_tls: Option<BackendTls>,
    connect_attempts: u32,
    connect_retry_delay: Duration,
    hooks: Arc<H>,
}

impl Proxy<PassthroughHooks> {
    pub fn new(backend_addr: impl Into<String>) -> Self {
        Proxy::with_hooks(backend_addr, PassthroughHooks)
    }
}

impl<H: ProxyHooks + 'static> Proxy<H> {
    pub fn with_hooks(backend_addr: impl Into<String>, hooks: H) -> Self {
        Proxy {
            backend_addr: backend_addr.into(),
            backend_tls: None,
            connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(50),
            hooks: Arc::new(hooks),
        }
    }

    /// Negotiate StartTLS toward the backend before serving requests.
    pub fn with_backend_tls(mut self, tls: BackendTls) -> Self {
        self.backend_tls = Some(tls);
        self
    }

    pub fn with_connect_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.connect_retry_delay = delay;
        self
    }

    /// Open the backend connection, retrying, and upgrade it when configured.
    async fn connect_backend(&self) -> Result<LdapClient, LdapError> {
        let mut last_err = None;
        for attempt in 0..self.connect_attempts {
            match LdapClient::connect(&self.backend_addr).await {
                Ok(client) => {
                    debug!("backend {} connected (attempt {})", self.backend_addr, attempt + 1);
                    if let Some(tls) = &self.backend_tls {
                        client.start_tls(Arc::clone(&tls.config), &tls.server_name).await?;
                    }
                    return Ok(client);
                }
                Err(e) => {
                    warn!(
                        "backend connect to {} failed (attempt {}): {}",
                        self.backend_addr,
                        attempt + 1,
                        e
                    );
                    last_err = Some(e);
                    if attempt + 1 < self.connect_attempts {
                        tokio::time::sleep(self.connect_retry_delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(LdapError::NotConnected))
    }

    /// Serve one client connection until it closes or sends Unbind.
    pub async fn serve_connection(&self, stream: TcpStream) -> Result<(), LdapError> {
        let (mut rd, wr) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<LdapMessage>();
        // Detached: drains queued responses after this loop returns and exits
        // once every sender (this loop and the relay tasks) is gone.
        tokio::spawn(write_loop(wr, writer_rx));

        let connect = self.connect_backend();
        tokio::pin!(connect);
        let mut backend: Option<LdapClient> = None;
        let mut queued: Vec<LdapMessage> = Vec::new();

        let mut buffer = BytesMut::with_capacity(4096);
        let mut read_buf = vec![0u8; 4096];

        'serve: loop {
            tokio::select! {
                connected = &mut connect, if backend.is_none() => match connected {
                    Ok(client) => {
                        for message in queued.drain(..) {
                            self.forward(&client, message, &writer_tx).await;
                        }
                        backend = Some(client);
                    }
                    Err(e) => {
                        // Spec'd failure mode: everything that was queued
                        // awaiting this connection gets an unavailable-class
                        // answer, never silence.
                        error!("backend {} unavailable: {}", self.backend_addr, e);
                        for message in queued.drain(..) {
                            if message.op.needs_answer() {
                                let result = LdapResult::from_error(&e);
                                let op = error_response_for_tag(
                                    Some(message.op.tag_number()),
                                    result,
                                );
                                let _ = writer_tx.send(LdapMessage::new(message.id, op));
                            }
                        }
                        break 'serve;
                    }
                },
                read = rd.read(&mut read_buf) => {
                    let n = match read {
                        Ok(0) => break 'serve,
                        Ok(n) => n,
                        Err(e) => {
                            debug!("client read error: {}", e);
                            break 'serve;
                        }
                    };
                    buffer.extend_from_slice(&read_buf[..n]);
                    loop {
                        match try_read_message(&mut buffer) {
                            Err(e) => {
                                warn!("invalid LDAP framing from client: {}", e);
                                break 'serve;
                            }
                            Ok(ParseOutcome::Incomplete) => break,
                            Ok(ParseOutcome::Invalid { id, tag, error }) => {
                                let op = error_response_for_tag(
                                    tag,
                                    LdapResult::new(
                                        ResultCode::ProtocolError,
                                        "",
                                        error.to_string(),
                                    ),
                                );
                                let _ = writer_tx.send(LdapMessage::new(id, op));
                            }
                            Ok(ParseOutcome::Message(parsed)) => {
                                let message = parsed.message;
                                if matches!(message.op, ProtocolOp::UnbindRequest) {
                                    if let Some(client) = &backend {
                                        client.unbind();
                                    }
                                    break 'serve;
                                }
                                if matches!(message.op, ProtocolOp::AbandonRequest(_)) {
                                    // Client ids do not map onto backend ids,
                                    // so abandons are not forwarded.
                                    debug!("abandon from client (ignored)");
                                    continue;
                                }
                                match &backend {
                                    Some(client) => {
                                        self.forward(client, message, &writer_tx).await
                                    }
                                    None => queued.push(message),
                                }
                            }
                        }
                    }
                }
            }
        }

        drop(writer_tx);
        Ok(())
    }

    /// Run a request through the hooks and relay its responses, keyed by the
    /// client's message id throughout.
    async fn forward(
        &self,
        backend: &LdapClient,
        message: LdapMessage,
        writer: &mpsc::UnboundedSender<LdapMessage>,
    ) {
        let client_id = message.id;
        let request_tag = message.op.tag_number();
        let needs_answer = message.op.needs_answer();

        let action = match self.hooks.before_forward(backend, message).await {
            Ok(action) => action,
            Err(e) => {
                warn!("before_forward hook failed: {}", e);
                if needs_answer {
                    let op = error_response_for_tag(Some(request_tag), LdapResult::from_error(&e));
                    let _ = writer.send(LdapMessage::new(client_id, op));
                }
                return;
            }
        };
        let request = match action {
            ForwardAction::Forward(request) => request,
            ForwardAction::Respond(ops) => {
                for op in ops {
                    let _ = writer.send(LdapMessage::new(client_id, op));
                }
                return;
            }
            ForwardAction::Drop => return,
        };
        if !request.op.needs_answer() {
            return;
        }

        let backend = backend.clone();
        let hooks = Arc::clone(&self.hooks);
        let writer = writer.clone();
        tokio::spawn(async move {
            let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<LdapMessage>();
            let op = request.op.clone();
            let controls = request.controls.clone();
            let exchange = backend.send_multi(op, controls, move |response| {
                let done = response.op.is_final_response();
                let _ = relay_tx.send(response.clone());
                done
            });
            let relay = async {
                while let Some(response) = relay_rx.recv().await {
                    match hooks.after_backend_response(response, &request).await {
                        Ok(response) => {
                            let _ = writer.send(LdapMessage { id: client_id, ..response });
                        }
                        Err(e) => {
                            warn!("after_backend_response hook failed: {}", e);
                            let op = error_response_for_tag(
                                Some(request.op.tag_number()),
                                LdapResult::from_error(&e),
                            );
                            let _ = writer.send(LdapMessage::new(client_id, op));
                            return Err(());
                        }
                    }
                }
                Ok(())
            };
            let (exchange, relayed) = tokio::join!(exchange, relay);
            if relayed.is_err() {
                return;
            }
            if let Err(e) = exchange {
                // The backend went away mid-exchange; the client still gets
                // its one terminal response.
                debug!("backend exchange failed: {}", e);
                let op = error_response_for_tag(
                    Some(request.op.tag_number()),
                    LdapResult::from_error(&e),
                );
                let _ = writer.send(LdapMessage::new(client_id, op));
            }
        });
    }
}

async fn write_loop(mut wr: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<LdapMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = wr.write_all(&message.to_bytes()).await {
            debug!("client write failed: {}", e);
            break;
        }
        if wr.flush().await.is_err() {
            break;
        }
    }
    let _ = wr.shutdown().await;
}
