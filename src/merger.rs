//! Multi-backend merger: fans Bind and Search requests out to every backend
//! and reassembles one answer stream for the client.
//!
//! Partial search entries are relayed to the client the moment a backend
//! produces them, unmodified, with no dedup and no reordering across
//! backends. The terminal Bind/Done response is held until every backend has
//! reported: success wins if at least one backend succeeded, otherwise the
//! first-seen failing code is returned (the only deterministic order
//! available at the merge point is arrival order). Write operations are
//! rejected outright because merge semantics for writes are undefined.
//!
//! The per-request correlation table is owned by the connection's single
//! event loop and never touched from anywhere else.

use std::collections::HashMap;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::client::LdapClient;
use crate::error::{LdapError, ResultCode};
use crate::proto::{
    error_response_for_tag, try_read_message, LdapMessage, LdapResult, ParseOutcome, ProtocolOp,
};

/// Correlation state for one fanned-out request: how many backends are still
/// pending, and the best terminal response seen so far.
struct MergeState {
    pending: usize,
    best: Option<ProtocolOp>,
}

impl MergeState {
    fn new(pending: usize) -> Self {
        MergeState { pending, best: None }
    }

    /// Record one backend's terminal response. A success displaces any
    /// failure; among failures the first seen is kept.
    fn observe(&mut self, op: ProtocolOp) {
        self.pending -= 1;
        let is_success = op.result().map(LdapResult::is_success).unwrap_or(false);
        match &self.best {
            None => self.best = Some(op),
            Some(current) => {
                let current_success =
                    current.result().map(LdapResult::is_success).unwrap_or(false);
                if is_success && !current_success {
                    self.best = Some(op);
                }
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.pending == 0
    }
}

/// Events flowing from the per-backend relay tasks into the connection loop.
enum MergeEvent {
    /// A partial response (search entry): relay immediately.
    Partial { client_id: i32, op: ProtocolOp },
    /// A backend's terminal response for this request.
    Final { client_id: i32, op: ProtocolOp },
}

/// A merging proxy over N backend servers.
pub struct Merger {
    backend_addrs: Vec<String>,
    connect_attempts: u32,
    connect_retry_delay: Duration,
}

impl Merger {
    pub fn new(backend_addrs: Vec<String>) -> Self {
        Merger {
            backend_addrs,
            connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(50),
        }
    }

    pub fn with_connect_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.connect_retry_delay = delay;
        self
    }

    async fn connect_one(&self, addr: &str) -> Result<LdapClient, LdapError> {
        let mut last_err = None;
        for attempt in 0..self.connect_attempts {
            match LdapClient::connect(addr).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    warn!("backend connect to {} failed (attempt {}): {}", addr, attempt + 1, e);
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
        // Bring up every backend leg. A backend that cannot be reached stays
        // as a None slot and counts as an immediate failure on every
        // fanned-out request.
        let mut backends: Vec<Option<LdapClient>> = Vec::with_capacity(self.backend_addrs.len());
        for addr in &self.backend_addrs {
            match self.connect_one(addr).await {
                Ok(client) => backends.push(Some(client)),
                Err(e) => {
                    error!("backend {} unavailable: {}", addr, e);
                    backends.push(None);
                }
            }
        }
        let backend_count = backends.len();

        let (mut rd, mut wr) = stream.into_split();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<MergeEvent>();
        let mut correlation: HashMap<i32, MergeState> = HashMap::new();

        let mut buffer = BytesMut::with_capacity(4096);
        let mut read_buf = vec![0u8; 4096];

        'serve: loop {
            tokio::select! {
                event = event_rx.recv() => {
                    // The loop holds a sender, so recv never returns None here.
                    let Some(event) = event else { break 'serve };
                    match event {
                        MergeEvent::Partial { client_id, op } => {
                            let message = LdapMessage::new(client_id, op);
                            if wr.write_all(&message.to_bytes()).await.is_err() {
                                break 'serve;
                            }
                        }
                        MergeEvent::Final { client_id, op } => {
                            let Some(state) = correlation.get_mut(&client_id) else {
                                warn!("stray terminal response for msgid {}", client_id);
                                continue;
                            };
                            state.observe(op);
                            if state.is_complete() {
                                let state = correlation
                                    .remove(&client_id)
                                    .expect("state present, just observed");
                                let merged = state.best.expect("observed at least one response");
                                debug!("all backends reported for msgid {}", client_id);
                                let message = LdapMessage::new(client_id, merged);
                                if wr.write_all(&message.to_bytes()).await.is_err() {
                                    break 'serve;
                                }
                            }
                        }
                    }
                    if wr.flush().await.is_err() {
                        break 'serve;
                    }
                }
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
                                let message = LdapMessage::new(id, op);
                                if wr.write_all(&message.to_bytes()).await.is_err() {
                                    break 'serve;
                                }
                            }
                            Ok(ParseOutcome::Message(parsed)) => {
                                let message = parsed.message;
                                match &message.op {
                                    ProtocolOp::UnbindRequest => {
                                        for backend in backends.iter().flatten() {
                                            backend.unbind();
                                        }
                                        break 'serve;
                                    }
                                    ProtocolOp::AbandonRequest(_) => {
                                        debug!("abandon from client (ignored)");
                                        continue;
                                    }
                                    ProtocolOp::BindRequest(_) | ProtocolOp::SearchRequest(_) => {
                                        correlation.insert(
                                            message.id,
                                            MergeState::new(backend_count),
                                        );
                                        fan_out(&backends, &message, &event_tx);
                                    }
                                    _ => {
                                        // Writes and extended operations have
                                        // no defined merge semantics: refused
                                        // without touching any backend.
                                        let response = reject_unmergeable(&message.op);
                                        let message = LdapMessage::new(message.id, response);
                                        if wr.write_all(&message.to_bytes()).await.is_err() {
                                            break 'serve;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    if wr.flush().await.is_err() {
                        break 'serve;
                    }
                }
            }
        }

        let _ = wr.shutdown().await;
        Ok(())
    }
}

/// Forward one request to every backend, keyed by the client's message id.
/// Unreachable backends report an immediate `unavailable` terminal.
fn fan_out(
    backends: &[Option<LdapClient>],
    message: &LdapMessage,
    event_tx: &mpsc::UnboundedSender<MergeEvent>,
) {
    let client_id = message.id;
    let request_tag = message.op.tag_number();
    for backend in backends {
        let Some(backend) = backend else {
            let op = error_response_for_tag(
                Some(request_tag),
                LdapResult::new(ResultCode::Unavailable, "", "backend unavailable"),
            );
            let _ = event_tx.send(MergeEvent::Final { client_id, op });
            continue;
        };
        let backend = backend.clone();
        let op = message.op.clone();
        let controls = message.controls.clone();
        let events = event_tx.clone();
        tokio::spawn(async move {
            let relay = events.clone();
            let exchange = backend
                .send_multi(op, controls, move |response| {
                    let done = response.op.is_final_response();
                    let event = if done {
                        MergeEvent::Final { client_id, op: response.op.clone() }
                    } else {
                        MergeEvent::Partial { client_id, op: response.op.clone() }
                    };
                    let _ = relay.send(event);
                    done
                })
                .await;
            if let Err(e) = exchange {
                debug!("backend exchange failed for msgid {}: {}", client_id, e);
                let op = error_response_for_tag(Some(request_tag), LdapResult::from_error(&e));
                let _ = events.send(MergeEvent::Final { client_id, op });
            }
        });
    }
}

/// The unconditional rejection for operations the merger cannot merge.
fn reject_unmergeable(op: &ProtocolOp) -> ProtocolOp {
    let result = LdapResult::new(
        ResultCode::UnwillingToPerform,
        "",
        format!("{} cannot be merged across backends", op.name()),
    );
    match op {
        ProtocolOp::ModifyRequest(_) => ProtocolOp::ModifyResponse(result),
        ProtocolOp::AddRequest(_) => ProtocolOp::AddResponse(result),
        ProtocolOp::DelRequest(_) => ProtocolOp::DelResponse(result),
        ProtocolOp::ModifyDNRequest(_) => ProtocolOp::ModifyDNResponse(result),
        ProtocolOp::ExtendedRequest(_) => {
            ProtocolOp::ExtendedResponse(crate::proto::ExtendedResponse::plain(result))
        }
        other => error_response_for_tag(Some(other.tag_number()), result),
    }
}
