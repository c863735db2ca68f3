//! # Transport Binding
//!
//! Abstraction over the publish/subscribe client the session engine talks to.
//! The engine never touches `rumqttc` directly; it only sees the traits in this
//! module, so both scheduling models sit behind one interface:
//!
//! ```text
//! transport/
//! ├── threaded.rs     - AsyncClient + EventLoop driven by a background tokio task
//! └── cooperative.rs  - blocking Client + Connection, pumped by Session::poll
//! ```
//!
//! ## Delivery
//!
//! Inbound traffic is handed to an [`InboundHandler`] registered at connect time.
//! Every callback receives a [`Link`] so the handler can answer (command
//! responses, config echo) from whatever context the transport delivers on.

pub mod cooperative;
#[cfg(test)]
pub(crate) mod memory;
#[cfg(test)]
pub(crate) mod stub;
pub mod threaded;

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};

use crate::session::protocol::SECURE_PORT;

pub use cooperative::CooperativeTransport;
pub use threaded::ThreadedTransport;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Authentication rejected by broker: {0}")]
    Auth(String),

    #[error("Connection refused by broker: {0}")]
    Refused(String),

    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Failed to publish on {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl TransportError {
    /// Maps an event loop failure onto the session's error taxonomy. Any
    /// refused ConnAck is final; I/O errors and timeouts stay retryable.
    pub fn from_connection(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectionRefused(
                code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
            ) => TransportError::Auth(format!("{:?}", code)),
            ConnectionError::ConnectionRefused(code) => {
                TransportError::Refused(format!("{:?}", code))
            }
            other => TransportError::Connect(other.to_string()),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Auth(_))
    }

    /// The broker answered and said no. Retrying with the same options
    /// cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Auth(_) | TransportError::Refused(_))
    }
}

/// Which scheduling model a transport uses for inbound delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Threaded,
    Cooperative,
}

/// Everything a transport needs to open the broker connection.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub server: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    pub fn uses_tls(&self) -> bool {
        self.port == SECURE_PORT
    }

    pub(crate) fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.server.clone(), self.port);
        options
            .set_credentials(self.username.clone(), self.password.clone())
            .set_keep_alive(self.keepalive);
        if self.uses_tls() {
            // rustls with the platform's native root store
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        options
    }
}

/// Outbound half of a connection. Handed to the [`InboundHandler`] on every
/// callback and implemented by each transport for the engine's own publishes.
pub trait Link {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
}

/// Receiver of connection results and inbound messages.
pub trait InboundHandler: Send + Sync {
    /// Called once per connection attempt, including every reconnect.
    fn on_connect(&self, link: &dyn Link, result: Result<(), TransportError>);

    /// Called once per inbound message.
    fn on_message(&self, link: &dyn Link, topic: &str, payload: &[u8]);

    /// Called when an established connection drops.
    fn on_connection_lost(&self, error: &TransportError);
}

pub trait Transport: Link {
    fn mode(&self) -> DeliveryMode;

    /// Opens the connection. `handler` must be registered before any traffic
    /// flows; the connect result is reported through it.
    fn connect(
        &mut self,
        options: &ConnectOptions,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), TransportError>;

    /// Closes the connection. Calling it on a closed transport is a no-op.
    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Processes whatever inbound traffic is pending. Transports that deliver
    /// on their own thread leave this as a no-op.
    fn pump(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl Link for rumqttc::Client {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

impl Link for rumqttc::AsyncClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// What an event loop notification means for the session.
#[derive(Debug, PartialEq)]
pub(crate) enum Delivery {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    Closed,
    Ignored,
}

impl Delivery {
    pub(crate) fn from_event(event: &Event) -> Self {
        match event {
            // rumqttc turns a refused ConnAck into an error, so this is success
            Event::Incoming(Packet::ConnAck(_)) => Delivery::Connected,
            Event::Incoming(Packet::Publish(publish)) => Delivery::Message {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            },
            Event::Outgoing(rumqttc::Outgoing::Disconnect) => Delivery::Closed,
            _ => Delivery::Ignored,
        }
    }
}

/// Forwards one notification to the handler. Returns `false` once the
/// connection has been closed on request.
pub(crate) fn dispatch(
    event: &Event,
    link: &dyn Link,
    handler: &dyn InboundHandler,
    connected: &mut bool,
) -> bool {
    match Delivery::from_event(event) {
        Delivery::Connected => {
            *connected = true;
            handler.on_connect(link, Ok(()));
        }
        Delivery::Message { topic, payload } => handler.on_message(link, &topic, &payload),
        Delivery::Closed => return false,
        Delivery::Ignored => tracing::trace!("Ignoring event: {:?}", event),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish};

    fn options(port: u16) -> ConnectOptions {
        ConnectOptions {
            server: "broker.local".to_string(),
            port,
            client_id: "device-1".to_string(),
            username: "json+device".to_string(),
            password: "secret".to_string(),
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn secure_port_selects_tls() {
        assert!(options(8883).uses_tls());
        assert!(!options(1883).uses_tls());
        assert!(!options(9000).uses_tls());
    }

    #[test]
    fn refused_credentials_are_auth_errors() {
        let bad_password =
            ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        let not_authorized = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        let unavailable = ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable);

        assert!(TransportError::from_connection(&bad_password).is_auth());
        assert!(TransportError::from_connection(&not_authorized).is_auth());
        assert!(!TransportError::from_connection(&unavailable).is_auth());
    }

    #[test]
    fn every_refused_connack_is_fatal() {
        for code in [
            ConnectReturnCode::BadClientId,
            ConnectReturnCode::ServiceUnavailable,
            ConnectReturnCode::RefusedProtocolVersion,
            ConnectReturnCode::BadUserNamePassword,
        ] {
            let err = TransportError::from_connection(&ConnectionError::ConnectionRefused(code));
            assert!(err.is_fatal(), "{:?} should be fatal", code);
        }

        let io = ConnectionError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        let err = TransportError::from_connection(&io);
        assert!(matches!(err, TransportError::Connect(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn classifies_event_loop_notifications() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert_eq!(Delivery::from_event(&connack), Delivery::Connected);

        let publish = Event::Incoming(Packet::Publish(Publish::new(
            "dev/cmd",
            QoS::AtMostOnce,
            br#"{"cid":1}"#.to_vec(),
        )));
        assert_eq!(
            Delivery::from_event(&publish),
            Delivery::Message {
                topic: "dev/cmd".to_string(),
                payload: br#"{"cid":1}"#.to_vec(),
            }
        );

        assert_eq!(
            Delivery::from_event(&Event::Incoming(Packet::PingResp)),
            Delivery::Ignored
        );
        assert_eq!(
            Delivery::from_event(&Event::Outgoing(rumqttc::Outgoing::Disconnect)),
            Delivery::Closed
        );
    }
}
