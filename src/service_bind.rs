//! Bind interception against service credentials.
//!
//! A non-anonymous Bind is not forwarded as-is: the proxy first searches a
//! configured identity subtree for `serviceSecurityObject` entries owned by
//! the bind DN and named after one of an ordered list of services, optionally
//! constrained to a `validFrom`/`validUntil` window, and tries a shadow Bind
//! against each candidate with the client-supplied password. The first
//! success answers the client; otherwise the real Bind is forwarded to the
//! backend (when fallback is enabled) or refused with `invalidCredentials`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::client::LdapClient;
use crate::dn::DistinguishedName;
use crate::error::{LdapError, ResultCode};
use crate::filter::Filter;
use crate::proto::{
    BindAuthentication, BindResponse, LdapMessage, LdapResult, ProtocolOp, SearchRequest,
};
use crate::proxy::{ForwardAction, ProxyHooks};

/// The objectClass of a shadow-credential entry.
pub const SERVICE_SECURITY_OBJECT: &str = "serviceSecurityObject";

/// GeneralizedTime rendering used by the validity window attributes.
const TIME_FORMAT: &str = "%Y%m%d%H%M%SZ";

/// Settings for the bind-interception proxy.
#[derive(Debug, Clone)]
pub struct ServiceBindConfig {
    /// Subtree searched for service security objects.
    pub base_dn: DistinguishedName,
    /// Service names tried in priority order.
    pub service_names: Vec<String>,
    /// Forward the real Bind to the backend when no service credential
    /// matches. Without fallback the client gets `invalidCredentials`.
    pub fallback: bool,
}

/// [`ProxyHooks`] implementation performing the interception. Plug into
/// [`crate::proxy::Proxy::with_hooks`].
pub struct ServiceBindingProxy {
    config: ServiceBindConfig,
}

impl ServiceBindingProxy {
    pub fn new(config: ServiceBindConfig) -> Self {
        ServiceBindingProxy { config }
    }

    /// The filter selecting usable shadow credentials for one service:
    /// owned by the binder, named for the service, and valid at `now` when
    /// the entry carries a validity window.
    fn candidate_filter(service: &str, owner: &str, now: DateTime<Utc>) -> Filter {
        let stamp = now.format(TIME_FORMAT).to_string();
        Filter::And(vec![
            Filter::equality("objectClass", SERVICE_SECURITY_OBJECT),
            Filter::equality("owner", owner),
            Filter::equality("cn", service),
            Filter::Or(vec![
                Filter::Not(Box::new(Filter::present("validFrom"))),
                Filter::LessOrEqual { attribute: "validFrom".into(), value: stamp.clone() },
            ]),
            Filter::Or(vec![
                Filter::Not(Box::new(Filter::present("validUntil"))),
                Filter::GreaterOrEqual { attribute: "validUntil".into(), value: stamp },
            ]),
        ])
    }

    /// Try every candidate entry for every configured service, in priority
    /// order. Returns the DN that accepted the shadow bind, if any.
    async fn try_service_binds(
        &self,
        backend: &LdapClient,
        owner: &str,
        password: &[u8],
        now: DateTime<Utc>,
    ) -> Option<String> {
        for service in &self.config.service_names {
            let request = SearchRequest::subtree(
                self.config.base_dn.to_string(),
                Self::candidate_filter(service, owner, now),
                vec![],
            );
            let entries = match backend.search(request).await {
                Ok((entries, result)) if result.is_success() => entries,
                Ok((_, result)) => {
                    debug!(
                        "service credential search for {} failed: {}",
                        service, result.result_code
                    );
                    continue;
                }
                Err(e) => {
                    warn!("service credential search for {} failed: {}", service, e);
                    continue;
                }
            };
            for entry in entries {
                match backend.bind(&entry.object_name, password).await {
                    Ok(_) => {
                        info!(
                            "service bind for {} succeeded against {}",
                            owner, entry.object_name
                        );
                        return Some(entry.object_name);
                    }
                    Err(LdapError::Result { code, .. }) => {
                        debug!(
                            "shadow bind against {} refused: {}",
                            entry.object_name,
                            code.name()
                        );
                    }
                    Err(e) => {
                        warn!("shadow bind against {} failed: {}", entry.object_name, e);
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl ProxyHooks for ServiceBindingProxy {
    async fn before_forward(
        &self,
        backend: &LdapClient,
        message: LdapMessage,
    ) -> Result<ForwardAction, LdapError> {
        let ProtocolOp::BindRequest(request) = &message.op else {
            return Ok(ForwardAction::Forward(message));
        };
        let BindAuthentication::Simple(password) = &request.authentication else {
            return Ok(ForwardAction::Forward(message));
        };
        if request.name.is_empty() || password.is_empty() {
            // Anonymous binds pass straight through.
            return Ok(ForwardAction::Forward(message));
        }

        if let Some(bound_dn) = self
            .try_service_binds(backend, &request.name, password, Utc::now())
            .await
        {
            debug!("answering bind for {} from service credential {}", request.name, bound_dn);
            return Ok(ForwardAction::Respond(vec![ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::new(ResultCode::Success, request.name.clone(), ""),
                server_sasl_creds: None,
            })]));
        }

        if self.config.fallback {
            debug!("no service credential for {}, falling back to backend bind", request.name);
            Ok(ForwardAction::Forward(message))
        } else {
            Ok(ForwardAction::Respond(vec![ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::new(ResultCode::InvalidCredentials, "", ""),
                server_sasl_creds: None,
            })]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{
        try_read_message, Attribute, BindRequest, ParseOutcome, SearchResultEntry,
    };
    use bytes::BytesMut;
    use chrono::TimeZone;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(fallback: bool) -> ServiceBindConfig {
        ServiceBindConfig {
            base_dn: DistinguishedName::parse("ou=services,dc=example,dc=com").unwrap(),
            service_names: vec!["mail".to_string(), "web".to_string()],
            fallback,
        }
    }

    #[test]
    fn test_candidate_filter_text() {
        let now = Utc.with_ymd_and_hms(2010, 1, 2, 3, 4, 5).unwrap();
        let filter = ServiceBindingProxy::candidate_filter(
            "mail",
            "cn=user,dc=example,dc=com",
            now,
        );
        assert_eq!(
            filter.to_text(),
            "(&(objectClass=serviceSecurityObject)(owner=cn=user,dc=example,dc=com)(cn=mail)\
             (|(!(validFrom=*))(validFrom<=20100102030405Z))\
             (|(!(validUntil=*))(validUntil>=20100102030405Z))"
                .to_owned()
                + ")"
        );
    }

    /// Backend that serves one service credential entry for service "mail"
    /// and accepts binds against it with the given password only.
    async fn scripted_backend(service_password: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buffer = BytesMut::with_capacity(4096);
                    let mut read_buf = vec![0u8; 4096];
                    loop {
                        let n = match socket.read(&mut read_buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buffer.extend_from_slice(&read_buf[..n]);
                        while let Ok(ParseOutcome::Message(parsed)) =
                            try_read_message(&mut buffer)
                        {
                            let id = parsed.message.id;
                            let replies = match &parsed.message.op {
                                ProtocolOp::SearchRequest(req) => {
                                    // Only the "mail" service has a credential.
                                    if req.filter.to_text().contains("(cn=mail)") {
                                        vec![
                                            ProtocolOp::SearchResultEntry(SearchResultEntry {
                                                object_name:
                                                    "cn=mail,ou=services,dc=example,dc=com"
                                                        .into(),
                                                attributes: vec![Attribute::strings(
                                                    "objectClass",
                                                    &[SERVICE_SECURITY_OBJECT],
                                                )],
                                            }),
                                            ProtocolOp::SearchResultDone(LdapResult::success()),
                                        ]
                                    } else {
                                        vec![ProtocolOp::SearchResultDone(LdapResult::success())]
                                    }
                                }
                                ProtocolOp::BindRequest(req) => {
                                    let ok = req.name
                                        == "cn=mail,ou=services,dc=example,dc=com"
                                        && matches!(
                                            &req.authentication,
                                            BindAuthentication::Simple(p)
                                                if p.as_slice() == service_password
                                        );
                                    let result = if ok {
                                        LdapResult::success()
                                    } else {
                                        LdapResult::new(
                                            ResultCode::InvalidCredentials,
                                            "",
                                            "bad shadow credential",
                                        )
                                    };
                                    vec![ProtocolOp::BindResponse(BindResponse {
                                        result,
                                        server_sasl_creds: None,
                                    })]
                                }
                                ProtocolOp::UnbindRequest => return,
                                _ => vec![],
                            };
                            for op in replies {
                                let bytes = LdapMessage::new(id, op).to_bytes();
                                if socket.write_all(&bytes).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn bind_message(dn: &str, password: &[u8]) -> LdapMessage {
        LdapMessage::new(7, ProtocolOp::BindRequest(BindRequest::simple(dn, password)))
    }

    #[tokio::test]
    async fn test_shadow_bind_answers_client_directly() {
        let backend_addr = scripted_backend(b"svc-secret").await;
        let backend = LdapClient::connect(&backend_addr.to_string()).await.unwrap();
        let hooks = ServiceBindingProxy::new(config(false));

        let action = hooks
            .before_forward(&backend, bind_message("cn=user,dc=example,dc=com", b"svc-secret"))
            .await
            .unwrap();
        let ForwardAction::Respond(ops) = action else {
            panic!("expected a direct response");
        };
        let [ProtocolOp::BindResponse(resp)] = ops.as_slice() else {
            panic!("expected one bind response");
        };
        assert!(resp.result.is_success());
        assert_eq!(resp.result.matched_dn, "cn=user,dc=example,dc=com");
    }

    #[tokio::test]
    async fn test_wrong_password_without_fallback_is_refused() {
        let backend_addr = scripted_backend(b"svc-secret").await;
        let backend = LdapClient::connect(&backend_addr.to_string()).await.unwrap();
        let hooks = ServiceBindingProxy::new(config(false));

        let action = hooks
            .before_forward(&backend, bind_message("cn=user,dc=example,dc=com", b"wrong"))
            .await
            .unwrap();
        let ForwardAction::Respond(ops) = action else {
            panic!("expected a direct refusal");
        };
        let [ProtocolOp::BindResponse(resp)] = ops.as_slice() else {
            panic!("expected one bind response");
        };
        assert_eq!(resp.result.result_code, ResultCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_wrong_password_with_fallback_forwards_real_bind() {
        let backend_addr = scripted_backend(b"svc-secret").await;
        let backend = LdapClient::connect(&backend_addr.to_string()).await.unwrap();
        let hooks = ServiceBindingProxy::new(config(true));

        let message = bind_message("cn=user,dc=example,dc=com", b"wrong");
        let action = hooks.before_forward(&backend, message.clone()).await.unwrap();
        let ForwardAction::Forward(forwarded) = action else {
            panic!("expected fallback forwarding");
        };
        assert_eq!(forwarded, message);
    }

    #[tokio::test]
    async fn test_anonymous_bind_passes_through() {
        let backend_addr = scripted_backend(b"svc-secret").await;
        let backend = LdapClient::connect(&backend_addr.to_string()).await.unwrap();
        let hooks = ServiceBindingProxy::new(config(false));

        let message = bind_message("", b"");
        let action = hooks.before_forward(&backend, message.clone()).await.unwrap();
        assert!(matches!(action, ForwardAction::Forward(m) if m == message));
    }

    #[tokio::test]
    async fn test_non_bind_operations_pass_through() {
        let backend_addr = scripted_backend(b"svc-secret").await;
        let backend = LdapClient::connect(&backend_addr.to_string()).await.unwrap();
        let hooks = ServiceBindingProxy::new(config(false));

        let message = LdapMessage::new(3, ProtocolOp::UnbindRequest);
        let action = hooks.before_forward(&backend, message.clone()).await.unwrap();
        assert!(matches!(action, ForwardAction::Forward(m) if m == message));
    }
}
