//! # Session Engine
//!
//! Owns the single logical connection between the device and the broker.
//! The engine drives connect and reconnect, routes inbound topic traffic to
//! the parameter and command registries, and publishes telemetry.
//!
//! ## Module Architecture
//!
//! ```text
//! session/
//! ├── engine.rs     - Session (public API) and SessionCore (shared state + routing)
//! ├── parameter.rs  - typed parameters, coercion, registry
//! ├── command.rs    - command handlers with "not found" fallback
//! ├── payload.rs    - the next dev/data message
//! ├── protocol.rs   - topics and wire message shapes
//! └── error.rs      - SessionError
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! dev/cfg/upd ──► ParameterRegistry ──► onChange callbacks ──► echo on dev/cfg
//! dev/cmd     ──► CommandRegistry   ──► handler(arg)       ──► dev/cmd/res
//! Payload     ──► send_data()       ──► dev/data
//! ```
//!
//! ## Concurrency
//!
//! With a threaded transport, inbound handling runs on the transport's
//! delivery task while the caller fills the payload. Registries and payload
//! share one mutex; parameter callbacks and command handlers are invoked after
//! it is released, so they may call back into the session.
//!
//! ## Failure Handling
//!
//! Malformed inbound messages are logged and dropped. Publish failures are
//! logged and returned. An authentication failure marks the session FAILED,
//! and that state together with any later `send_data` is escalated according
//! to [`FailurePolicy`].

pub mod command;
pub mod engine;
pub mod error;
pub mod parameter;
pub mod payload;
pub mod protocol;

pub use command::{CommandHandler, CommandRegistry};
pub use engine::{
    ConnectionState, FailurePolicy, Session, SessionSettings, SessionStatus, EXIT_FATAL,
};
pub use error::SessionError;
pub use parameter::{ParamCallback, ParamType, ParamValue, ParameterRegistry};
pub use payload::Payload;
