use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::command::{is_empty_response, CommandRegistry};
use super::error::SessionError;
use super::parameter::{ParamCallback, ParamChange, ParamType, ParamValue, ParameterRegistry};
use super::payload::Payload;
use super::protocol::{
    CommandRequest, CommandResponse, ConfigUpdate, COMMAND_RESPONSE_TOPIC, COMMAND_TOPIC,
    CONFIG_TOPIC, CONFIG_UPDATE_TOPIC, DATA_TOPIC, DEFAULT_SERVER, PROTOCOL_USERNAME,
};
use crate::credentials::CredentialSource;
use crate::transport::{
    ConnectOptions, DeliveryMode, InboundHandler, Link, Transport, TransportError,
};

/// Exit status used when the session escalates to process termination.
pub const EXIT_FATAL: i32 = 1;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    /// The broker rejected our credentials. Terminal for the session.
    Failed,
}

/// What happens on authentication failure and on sends after it.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and terminate the process.
    #[default]
    Exit,
    /// Log and hand the error back to the caller.
    Report,
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub server: String,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            failure_policy: FailurePolicy::Exit,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub messages_sent: usize,
    pub messages_received: usize,
    pub last_activity: Option<DateTime<Local>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct SessionState {
    status: SessionStatus,
    parameters: ParameterRegistry,
    commands: CommandRegistry,
    payload: Payload,
}

/// State shared between the caller and the transport's delivery context.
/// Everything mutable sits behind one lock; user callbacks and publishes run
/// after it is released.
pub(crate) struct SessionCore {
    state: Mutex<SessionState>,
    failure_policy: FailurePolicy,
}

impl SessionCore {
    fn new(failure_policy: FailurePolicy) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            failure_policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn escalate(&self, err: SessionError) -> SessionError {
        match self.failure_policy {
            FailurePolicy::Exit => {
                error!("Fatal session error, terminating: {}", err);
                std::process::exit(EXIT_FATAL);
            }
            FailurePolicy::Report => {
                error!("Fatal session error: {}", err);
                err
            }
        }
    }

    fn record_error(&self, err: &dyn std::fmt::Display) {
        self.lock().status.last_error = Some(err.to_string());
    }

    fn publish<B: Serialize>(
        &self,
        link: &dyn Link,
        topic: &str,
        body: &B,
    ) -> Result<(), SessionError> {
        let bytes = serde_json::to_vec(body)?;
        info!("Publishing message on topic: {}", topic);
        debug!("{}", String::from_utf8_lossy(&bytes));

        match link.publish(topic, bytes) {
            Ok(()) => {
                let mut state = self.lock();
                state.status.messages_sent += 1;
                state.status.last_activity = Some(Local::now());
                Ok(())
            }
            Err(e) => {
                warn!("Publish on {} failed: {}", topic, e);
                self.record_error(&e);
                Err(e.into())
            }
        }
    }

    fn send_config(&self, link: &dyn Link) -> Result<(), SessionError> {
        let snapshot = self.lock().parameters.snapshot();
        self.publish(link, CONFIG_TOPIC, &snapshot)
    }

    fn handle_config_update(&self, link: &dyn Link, payload: &[u8]) -> Result<(), SessionError> {
        let message: Value =
            serde_json::from_slice(payload).map_err(|e| malformed(CONFIG_UPDATE_TOPIC, e))?;
        debug!("Received config update: {}", message);
        let update: ConfigUpdate = serde_json::from_value(message.clone())
            .map_err(|e| malformed(CONFIG_UPDATE_TOPIC, e))?;

        let changes: Vec<ParamChange> = {
            let mut state = self.lock();
            update
                .cfg
                .iter()
                .filter_map(|(name, entry)| {
                    state
                        .parameters
                        .apply_update(name, entry)
                        .unwrap_or_else(|e| {
                            warn!("Skipping parameter {}: {}", name, e);
                            None
                        })
                })
                .collect()
        };

        for change in &changes {
            info!("Parameter {} updated to {}", change.name, change.value);
            change.notify();
        }

        // the server expects its update echoed back as acknowledgement
        self.publish(link, CONFIG_TOPIC, &message)
    }

    fn handle_command(&self, link: &dyn Link, payload: &[u8]) -> Result<(), SessionError> {
        let request: CommandRequest =
            serde_json::from_slice(payload).map_err(|e| malformed(COMMAND_TOPIC, e))?;
        info!("Received command {:?} (cid {})", request.req, request.cid);
        debug!("Command argument: {}", request.arg);

        let handler = self.lock().commands.resolve(&request.req);
        // invoked without the lock held; blocks delivery until it returns
        let response = handler(&request.arg);

        let reply = CommandResponse {
            cid: request.cid,
            res: (!is_empty_response(&response)).then_some(response),
        };
        self.publish(link, COMMAND_RESPONSE_TOPIC, &reply)
    }
}

fn malformed(topic: &str, err: serde_json::Error) -> SessionError {
    SessionError::MalformedMessage {
        topic: topic.to_string(),
        reason: err.to_string(),
    }
}

impl InboundHandler for SessionCore {
    fn on_connect(&self, link: &dyn Link, result: Result<(), TransportError>) {
        match result {
            Ok(()) => {
                let (has_commands, has_parameters) = {
                    let mut state = self.lock();
                    state.status.connection_state = ConnectionState::Connected;
                    state.status.last_activity = Some(Local::now());
                    (!state.commands.is_empty(), !state.parameters.is_empty())
                };
                info!("Connected!");

                if has_commands {
                    info!("Subscribing commands");
                    if let Err(e) = link.subscribe(COMMAND_TOPIC) {
                        warn!("{}", e);
                        self.record_error(&e);
                    }
                }
                if has_parameters {
                    info!("Subscribing parameters");
                    if let Err(e) = link.subscribe(CONFIG_UPDATE_TOPIC) {
                        warn!("{}", e);
                        self.record_error(&e);
                    }
                    if let Err(e) = self.send_config(link) {
                        warn!("Initial config sync failed: {}", e);
                    }
                }
            }
            Err(err) if err.is_fatal() => {
                {
                    let mut state = self.lock();
                    state.status.connection_state = ConnectionState::Failed;
                    state.status.last_error = Some(err.to_string());
                }
                if err.is_auth() {
                    error!("Check your api key");
                }
                let _ = self.escalate(SessionError::Transport(err));
            }
            Err(err) => {
                warn!("Connection attempt failed: {}", err);
                let mut state = self.lock();
                if state.status.connection_state != ConnectionState::Failed {
                    state.status.connection_state = ConnectionState::Disconnected;
                }
                state.status.last_error = Some(err.to_string());
            }
        }
    }

    fn on_message(&self, link: &dyn Link, topic: &str, payload: &[u8]) {
        {
            let mut state = self.lock();
            state.status.messages_received += 1;
            state.status.last_activity = Some(Local::now());
        }

        let outcome = match topic {
            CONFIG_UPDATE_TOPIC => self.handle_config_update(link, payload),
            COMMAND_TOPIC => self.handle_command(link, payload),
            other => {
                debug!("Ignoring message on unhandled topic {}", other);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!("Failed to handle message on {}: {}", topic, e);
            self.record_error(&e);
        }
    }

    fn on_connection_lost(&self, error: &TransportError) {
        warn!("Connection lost: {}", error);
        let mut state = self.lock();
        if state.status.connection_state != ConnectionState::Failed {
            state.status.connection_state = ConnectionState::Disconnected;
        }
        state.status.last_error = Some(error.to_string());
    }
}

/// One logical connection to the broker.
///
/// Parameters and commands must be registered before [`Session::connect`];
/// the on-connect handshake only subscribes to topics that have something
/// registered. With a cooperative transport, inbound traffic is processed
/// only inside [`Session::poll`].
pub struct Session<T: Transport, C: CredentialSource> {
    core: Arc<SessionCore>,
    transport: T,
    credentials: C,
    settings: SessionSettings,
    open: bool,
}

impl<T: Transport, C: CredentialSource> Session<T, C> {
    pub fn new(transport: T, credentials: C) -> Self {
        Self::with_settings(transport, credentials, SessionSettings::default())
    }

    pub fn with_settings(transport: T, credentials: C, settings: SessionSettings) -> Self {
        Self {
            core: Arc::new(SessionCore::new(settings.failure_policy)),
            transport,
            credentials,
            settings,
            open: false,
        }
    }

    pub fn connect(&mut self) -> Result<(), SessionError> {
        if self.connection_state() == ConnectionState::Failed {
            let reason = "session was already rejected by the broker";
            return Err(TransportError::Refused(reason.to_string()).into());
        }

        self.credentials.network_connect(&self.settings.server)?;

        let options = ConnectOptions {
            server: self.settings.server.clone(),
            port: self.credentials.port(),
            client_id: self.credentials.client_id().to_string(),
            username: PROTOCOL_USERNAME.to_string(),
            password: self.credentials.api_key().to_string(),
            keepalive: self.settings.keepalive,
            connect_timeout: self.settings.connect_timeout,
        };
        info!(
            "Connecting to {}:{} as {} ({:?} delivery)",
            options.server,
            options.port,
            options.client_id,
            self.transport.mode()
        );

        self.open = true;
        let handler: Arc<dyn InboundHandler> = self.core.clone();
        self.transport.connect(&options, handler).map_err(|e| {
            error!("Connect failed: {}", e);
            SessionError::from(e)
        })
    }

    /// Closes the connection. Safe to call repeatedly.
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        if !self.open {
            debug!("Session already disconnected");
            return Ok(());
        }
        self.transport.disconnect()?;
        self.open = false;

        let mut state = self.core.lock();
        if state.status.connection_state == ConnectionState::Connected {
            state.status.connection_state = ConnectionState::Disconnected;
        }
        info!("Disconnected");
        Ok(())
    }

    /// Processes pending inbound messages. A no-op for threaded transports.
    pub fn poll(&mut self) -> Result<(), SessionError> {
        self.transport.pump().map_err(|e| {
            debug!("Poll failed: {}", e);
            SessionError::from(e)
        })
    }

    pub fn add_parameter(
        &self,
        name: impl Into<String>,
        value: impl Into<ParamValue>,
        declared: ParamType,
    ) -> Result<(), SessionError> {
        self.core
            .lock()
            .parameters
            .add(name, value.into(), declared, None)
    }

    /// Like [`Session::add_parameter`], with a callback run on every update
    /// received from the server.
    pub fn add_parameter_with_callback<F>(
        &self,
        name: impl Into<String>,
        value: impl Into<ParamValue>,
        declared: ParamType,
        on_change: F,
    ) -> Result<(), SessionError>
    where
        F: Fn(&str, &ParamValue) + Send + Sync + 'static,
    {
        let callback: ParamCallback = Arc::new(on_change);
        self.core
            .lock()
            .parameters
            .add(name, value.into(), declared, Some(callback))
    }

    pub fn get_parameter(&self, name: &str) -> Result<ParamValue, SessionError> {
        self.core.lock().parameters.get(name)
    }

    pub fn add_command<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.core.lock().commands.add(name, Arc::new(handler));
    }

    pub fn add_to_payload(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.core.lock().payload.add_value(name, value);
    }

    pub fn set_object_as_payload(&self, object: Map<String, Value>) {
        self.core.lock().payload.set_object(object);
    }

    pub fn add_model(&self, model: impl Into<String>) {
        self.core.lock().payload.set_model(model);
    }

    pub fn add_tag(&self, tag: impl Into<String>) {
        self.core.lock().payload.add_tag(tag);
    }

    pub fn add_tags<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.core.lock().payload.add_tags(tags);
    }

    /// Publishes the pending payload on `dev/data` and resets it. The payload
    /// is cleared even when the publish fails; there is no retry.
    pub fn send_data(&self) -> Result<(), SessionError> {
        let payload = {
            let mut state = self.core.lock();
            if state.status.connection_state == ConnectionState::Failed {
                drop(state);
                return Err(self.core.escalate(SessionError::SendAfterFailure));
            }
            state.payload.take()
        };
        self.core.publish(&self.transport, DATA_TOPIC, &payload)
    }

    /// Publishes the full parameter snapshot on `dev/cfg`.
    pub fn send_config(&self) -> Result<(), SessionError> {
        self.core.send_config(&self.transport)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core.lock().status.connection_state
    }

    pub fn status(&self) -> SessionStatus {
        self.core.lock().status.clone()
    }

    pub fn mode(&self) -> DeliveryMode {
        self.transport.mode()
    }
}
