//! Command handlers.

use crate::error::ServerError;
use crate::session::{ClientIdentity, Session, SessionState};
use crate::target::{AttachedClient, Target, TargetRegistry};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tas_protocol::message::*;
use tas_protocol::{ServerInfo, PROTOCOL_VERSION};

/// Server name reported in HELLO.
pub const SERVER_NAME: &str = "tas-sim";

/// Command handler.
pub struct CommandHandler {
    registry: Arc<TargetRegistry>,
    info: ServerInfo,
    started: Instant,
}

impl CommandHandler {
    /// Creates a new command handler.
    pub fn new(registry: Arc<TargetRegistry>) -> Self {
        let now = Utc::now();
        let info = ServerInfo {
            server_name: SERVER_NAME.to_string(),
            v_major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            v_minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            date: now.format("%Y-%m-%d").to_string(),
            supp_protoc_ver: 1 << PROTOCOL_VERSION,
            supp_chl_target: 1,
            supp_trc_type: 0,
            start_time_us: u64::try_from(now.timestamp_micros()).unwrap_or(0),
        };
        Self {
            registry,
            info,
            started: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Microseconds since the handler was created.
    pub fn uptime_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    /// Handles a request, waiting on long polls such as CHL_RCV.
    pub async fn dispatch(&self, session: &mut Session, request: &Request) -> Response {
        match request.op {
            Operation::ChlRcv => {
                session.record_request();
                let result = match self.check_ready(session, &request.op) {
                    Ok(()) => self.handle_chl_rcv(session, &request.params).await,
                    Err(e) => Err(e),
                };
                self.respond(session, request, result)
            }
            _ => self.handle(session, request),
        }
    }

    /// Handles a request and returns a response. CHL_RCV only polls the
    /// queue here; [`CommandHandler::dispatch`] waits for its timeout.
    pub fn handle(&self, session: &mut Session, request: &Request) -> Response {
        session.record_request();

        let result = match self.check_ready(session, &request.op) {
            Err(e) => Err(e),
            Ok(()) => match request.op {
                Operation::Hello => self.handle_hello(session, &request.params),
                Operation::Bye => self.handle_bye(session),
                Operation::GetTargets => self.handle_get_targets(),
                Operation::GetTargetClients => self.handle_get_target_clients(&request.params),
                Operation::SessionStart => self.handle_session_start(session, &request.params),
                Operation::Ping => self.handle_ping(session),
                Operation::DeviceConnect => self.handle_device_connect(session, &request.params),
                Operation::Rw => self.handle_rw(session, &request.params),
                Operation::ChlSubscribe => self.handle_chl_subscribe(session, &request.params),
                Operation::ChlUnsubscribe => {
                    self.handle_chl_unsubscribe(session, &request.params)
                }
                Operation::ChlSend => self.handle_chl_send(session, &request.params),
                Operation::ChlRcv => self.handle_chl_poll(session, &request.params),
                Operation::ChlList => self.handle_chl_list(session),
            },
        };

        self.respond(session, request, result)
    }

    /// Releases everything the session holds on its target.
    pub fn disconnect(&self, session: &mut Session) {
        if let Some(target) = session.unbind() {
            tracing::debug!(
                "Session {} detached from {}",
                session.id,
                target.identifier()
            );
        }
    }

    fn check_ready(&self, session: &Session, op: &Operation) -> Result<(), ServerError> {
        match (session.state(), op) {
            (SessionState::Connected, Operation::Hello) => Ok(()),
            (SessionState::Connected, _) => Err(ServerError::NotReady),
            (_, Operation::Hello) => Err(ServerError::InvalidRequest(
                "handshake already completed".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn respond(
        &self,
        session: &Session,
        request: &Request,
        result: Result<Value, ServerError>,
    ) -> Response {
        let response = match result {
            Ok(value) => Response::ok(&request.id, value),
            Err(e) => {
                tracing::debug!("{:?} failed: {}", request.op, e);
                Response::error(
                    &request.id,
                    ResponseError::new(e.error_code(), e.to_string()),
                )
            }
        };
        match session.target() {
            Some(target) => response.with_meta(ResponseMeta {
                reset_count: Some(target.reset_count()),
                ..Default::default()
            }),
            None => response,
        }
    }

    fn handle_hello(&self, session: &mut Session, params: &Value) -> Result<Value, ServerError> {
        let hello: HelloParams = parse(params)?;

        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::UnsupportedProtocol(hello.protocol_version));
        }

        tracing::info!(
            "[{}] Client '{}' ({}, pid {}) connected",
            session.peer,
            hello.client_name,
            hello.user_name,
            hello.client_pid
        );
        session.complete_handshake(hello.protocol_version, ClientIdentity::from(hello));

        let result = HelloResult {
            protocol_version: PROTOCOL_VERSION,
            server: self.info.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    fn handle_bye(&self, session: &mut Session) -> Result<Value, ServerError> {
        self.disconnect(session);
        session.set_state(SessionState::Closing);
        Ok(json!({}))
    }

    fn handle_get_targets(&self) -> Result<Value, ServerError> {
        let targets = self.registry.list().iter().map(|t| t.info()).collect();
        Ok(serde_json::to_value(GetTargetsResult { targets })?)
    }

    fn handle_get_target_clients(&self, params: &Value) -> Result<Value, ServerError> {
        let p: GetTargetClientsParams = parse(params)?;
        let target = self.lookup(&p.identifier)?;
        let (session_name, session_start_time_us, clients) = target.clients();
        Ok(serde_json::to_value(GetTargetClientsResult {
            session_name,
            session_start_time_us,
            clients,
        })?)
    }

    fn handle_session_start(
        &self,
        session: &mut Session,
        params: &Value,
    ) -> Result<Value, ServerError> {
        let p: SessionStartParams = parse(params)?;
        if let Some(bound) = session.target() {
            return Err(ServerError::Usage(format!(
                "session already bound to {}",
                bound.identifier()
            )));
        }
        let target = self.lookup(&p.identifier)?;

        let client = AttachedClient {
            session_id: session.id.clone(),
            identity: session.identity().clone(),
            connect_time_us: session.connect_time_us(),
            traffic: session.traffic().clone(),
        };
        target.attach(client, &p.session_name, &p.session_pw, self.uptime_us())?;
        session.bind(target.clone());

        tracing::info!(
            "[{}] Bound to target {} in session '{}'",
            session.peer,
            target.identifier(),
            p.session_name
        );
        Ok(serde_json::to_value(target.con_info())?)
    }

    fn handle_ping(&self, session: &Session) -> Result<Value, ServerError> {
        let target = bound(session)?;
        Ok(serde_json::to_value(target.con_info())?)
    }

    fn handle_device_connect(
        &self,
        session: &Session,
        params: &Value,
    ) -> Result<Value, ServerError> {
        let target = bound(session)?;
        let p: DeviceConnectParams = parse(params)?;
        Ok(serde_json::to_value(target.connect(p.mode))?)
    }

    fn handle_rw(&self, session: &Session, params: &Value) -> Result<Value, ServerError> {
        let target = bound(session)?;
        let p: RwParams = parse(params)?;
        let results = target.execute(&p.items)?;
        Ok(serde_json::to_value(RwResult { results })?)
    }

    fn handle_chl_subscribe(
        &self,
        session: &Session,
        params: &Value,
    ) -> Result<Value, ServerError> {
        let target = bound(session)?;
        let p: ChlSubscribeParams = parse(params)?;
        let prio = target
            .hub()
            .subscribe(&session.id, p.chl, p.direction, p.mode, p.prio)?;
        Ok(serde_json::to_value(ChlSubscribeResult { chl: p.chl, prio })?)
    }

    fn handle_chl_unsubscribe(
        &self,
        session: &Session,
        params: &Value,
    ) -> Result<Value, ServerError> {
        let target = bound(session)?;
        let p: ChlUnsubscribeParams = parse(params)?;
        let removed = target.hub().unsubscribe(&session.id, p.chl);
        Ok(serde_json::to_value(ChlUnsubscribeResult {
            chl: p.chl,
            removed,
        })?)
    }

    fn handle_chl_send(&self, session: &Session, params: &Value) -> Result<Value, ServerError> {
        let target = bound(session)?;
        let p: ChlSendParams = parse(params)?;
        let num_bytes = target.hub().send(&session.id, p.chl, &p.data)?;
        Ok(serde_json::to_value(ChlSendResult { num_bytes })?)
    }

    fn handle_chl_poll(&self, session: &Session, params: &Value) -> Result<Value, ServerError> {
        let target = bound(session)?;
        let p: ChlRcvParams = parse(params)?;
        let fragment = target
            .hub()
            .try_receive(&session.id, p.chl)?
            .ok_or(ServerError::ChannelTimeout(p.chl))?;
        Ok(serde_json::to_value(ChlRcvResult {
            chl: p.chl,
            data: fragment.data,
            first: fragment.first,
        })?)
    }

    async fn handle_chl_rcv(
        &self,
        session: &Session,
        params: &Value,
    ) -> Result<Value, ServerError> {
        let target = bound(session)?.clone();
        let p: ChlRcvParams = parse(params)?;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(p.timeout_ms as u64);
        let fragment = target.hub().receive(&session.id, p.chl, deadline).await?;
        Ok(serde_json::to_value(ChlRcvResult {
            chl: p.chl,
            data: fragment.data,
            first: fragment.first,
        })?)
    }

    fn handle_chl_list(&self, session: &Session) -> Result<Value, ServerError> {
        let target = bound(session)?;
        let channels = target.hub().list(&session.id);
        Ok(serde_json::to_value(ChlListResult { channels })?)
    }

    fn lookup(&self, identifier: &str) -> Result<Arc<Target>, ServerError> {
        self.registry
            .get(identifier)
            .ok_or_else(|| ServerError::TargetNotFound(identifier.to_string()))
    }
}

fn bound(session: &Session) -> Result<&Arc<Target>, ServerError> {
    session.target().ok_or(ServerError::NoSession)
}

fn parse<T: DeserializeOwned>(params: &Value) -> Result<T, ServerError> {
    serde_json::from_value(params.clone()).map_err(|e| ServerError::InvalidRequest(e.to_string()))
}
