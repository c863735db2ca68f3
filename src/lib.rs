//! Device-side agent for a cloud telemetry broker.
//!
//! A [`Session`] keeps one MQTT connection open, publishes telemetry payloads,
//! mirrors device parameters with the server and answers remote commands.
//! Two transports are available: [`ThreadedTransport`] delivers inbound
//! messages on a background task, [`CooperativeTransport`] only when the
//! caller invokes [`Session::poll`].

pub mod config;
pub mod credentials;
pub mod session;
pub mod transport;

pub use credentials::{CredentialSource, DeviceCredentials, NetworkFamily};
pub use session::{
    ConnectionState, FailurePolicy, ParamType, ParamValue, Session, SessionError,
    SessionSettings, SessionStatus,
};
pub use transport::{CooperativeTransport, DeliveryMode, ThreadedTransport, Transport};
