//! Wire-level contract with the broker: topic names, credentials convention
//! and the JSON message shapes exchanged on each topic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::parameter::{ParamType, ParamValue};

pub const DATA_TOPIC: &str = "dev/data";
pub const CONFIG_TOPIC: &str = "dev/cfg";
pub const CONFIG_UPDATE_TOPIC: &str = "dev/cfg/upd";
pub const COMMAND_TOPIC: &str = "dev/cmd";
pub const COMMAND_RESPONSE_TOPIC: &str = "dev/cmd/res";

/// Fixed MQTT username; the API key travels as the password.
pub const PROTOCOL_USERNAME: &str = "json+device";

pub const DEFAULT_SERVER: &str = "mqtt.liveobjects.orange-business.com";
pub const SECURE_PORT: u16 = 8883;
pub const PLAIN_PORT: u16 = 1883;

/// Inbound on `dev/cmd`.
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub cid: Value,
    pub req: String,
    #[serde(default)]
    pub arg: Value,
}

/// Outbound on `dev/cmd/res`. `res` is left out entirely for empty responses.
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub cid: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub res: Option<Value>,
}

/// One parameter as it appears inside `cfg`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigEntry {
    pub t: ParamType,
    pub v: ParamValue,
}

/// Outbound snapshot on `dev/cfg`.
#[derive(Debug, Default, Serialize)]
pub struct ConfigSnapshot {
    pub cfg: BTreeMap<String, ConfigEntry>,
}

/// Inbound update on `dev/cfg/upd`. Entries stay raw so a single bad entry
/// does not reject the whole update.
#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    pub cfg: Map<String, Value>,
}
