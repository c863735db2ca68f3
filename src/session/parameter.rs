//! Device parameters mirrored with the server.
//!
//! Every parameter carries a declared [`ParamType`]. Values are coerced into
//! that type's native representation on every write and again on every read,
//! so the stored value always matches the declared type.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::error::SessionError;
use super::protocol::{ConfigEntry, ConfigSnapshot};

/// Invoked with the parameter name and its new, coerced value.
pub type ParamCallback = Arc<dyn Fn(&str, &ParamValue) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    #[serde(rename = "i32")]
    Int,
    #[serde(rename = "u32")]
    UInt,
    #[serde(rename = "str")]
    String,
    #[serde(rename = "bin")]
    Binary,
    #[serde(rename = "f64")]
    Float,
}

impl ParamType {
    pub fn tag(self) -> &'static str {
        match self {
            ParamType::Int => "i32",
            ParamType::UInt => "u32",
            ParamType::String => "str",
            ParamType::Binary => "bin",
            ParamType::Float => "f64",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "i32" => Some(ParamType::Int),
            "u32" => Some(ParamType::UInt),
            "str" => Some(ParamType::String),
            "bin" => Some(ParamType::Binary),
            "f64" => Some(ParamType::Float),
            _ => None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i32),
    UInt(u32),
    String(String),
    Binary(bool),
    Float(f64),
}

impl ParamValue {
    /// Converts this value into `target`'s representation.
    ///
    /// Floats truncate toward zero when narrowed to integers, strings are
    /// parsed, and booleans map to 0/1. Anything out of range fails, and so
    /// do NaN and infinities since JSON cannot carry them.
    pub fn coerce(&self, target: ParamType) -> Result<ParamValue, SessionError> {
        let fail = || SessionError::Coercion {
            value: self.to_string(),
            target,
        };

        let coerced = match (target, self) {
            (ParamType::Int, ParamValue::Int(v)) => ParamValue::Int(*v),
            (ParamType::Int, ParamValue::UInt(v)) => {
                ParamValue::Int(i32::try_from(*v).map_err(|_| fail())?)
            }
            (ParamType::Int, ParamValue::Float(v)) => {
                let whole = float_to_integer(*v).ok_or_else(fail)?;
                ParamValue::Int(i32::try_from(whole).map_err(|_| fail())?)
            }
            (ParamType::Int, ParamValue::String(s)) => {
                ParamValue::Int(s.trim().parse().map_err(|_| fail())?)
            }
            (ParamType::Int, ParamValue::Binary(b)) => ParamValue::Int(i32::from(*b)),

            (ParamType::UInt, ParamValue::Int(v)) => {
                ParamValue::UInt(u32::try_from(*v).map_err(|_| fail())?)
            }
            (ParamType::UInt, ParamValue::UInt(v)) => ParamValue::UInt(*v),
            (ParamType::UInt, ParamValue::Float(v)) => {
                let whole = float_to_integer(*v).ok_or_else(fail)?;
                ParamValue::UInt(u32::try_from(whole).map_err(|_| fail())?)
            }
            (ParamType::UInt, ParamValue::String(s)) => {
                ParamValue::UInt(s.trim().parse().map_err(|_| fail())?)
            }
            (ParamType::UInt, ParamValue::Binary(b)) => ParamValue::UInt(u32::from(*b)),

            (ParamType::String, ParamValue::String(s)) => ParamValue::String(s.clone()),
            (ParamType::String, other) => ParamValue::String(other.to_string()),

            (ParamType::Binary, ParamValue::Int(v)) => ParamValue::Binary(*v != 0),
            (ParamType::Binary, ParamValue::UInt(v)) => ParamValue::Binary(*v != 0),
            (ParamType::Binary, ParamValue::Float(v)) => ParamValue::Binary(*v != 0.0),
            (ParamType::Binary, ParamValue::String(s)) => {
                ParamValue::Binary(parse_flag(s).ok_or_else(fail)?)
            }
            (ParamType::Binary, ParamValue::Binary(b)) => ParamValue::Binary(*b),

            (ParamType::Float, ParamValue::Int(v)) => ParamValue::Float(f64::from(*v)),
            (ParamType::Float, ParamValue::UInt(v)) => ParamValue::Float(f64::from(*v)),
            (ParamType::Float, ParamValue::Float(v)) => ParamValue::Float(*v),
            (ParamType::Float, ParamValue::String(s)) => {
                ParamValue::Float(s.trim().parse().map_err(|_| fail())?)
            }
            (ParamType::Float, ParamValue::Binary(b)) => {
                ParamValue::Float(if *b { 1.0 } else { 0.0 })
            }
        };
        if matches!(coerced, ParamValue::Float(v) if !v.is_finite()) {
            return Err(fail());
        }
        Ok(coerced)
    }

    /// Reads a JSON scalar and coerces it into `target`.
    pub fn from_json(value: &Value, target: ParamType) -> Result<ParamValue, SessionError> {
        let natural = match value {
            Value::Bool(b) => ParamValue::Binary(*b),
            Value::String(s) => ParamValue::String(s.clone()),
            Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    if let Ok(v) = i32::try_from(v) {
                        ParamValue::Int(v)
                    } else if let Ok(v) = u32::try_from(v) {
                        ParamValue::UInt(v)
                    } else {
                        ParamValue::Float(n.as_f64().unwrap_or(f64::NAN))
                    }
                } else {
                    ParamValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::Null | Value::Array(_) | Value::Object(_) => {
                return Err(SessionError::Coercion {
                    value: value.to_string(),
                    target,
                })
            }
        };
        natural.coerce(target)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::UInt(v) => write!(f, "{}", v),
            ParamValue::String(v) => f.write_str(v),
            ParamValue::Binary(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::UInt(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Binary(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::String(v)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn float_to_integer(v: f64) -> Option<i64> {
    if !v.is_finite() || v.abs() >= 9.0e15 {
        return None;
    }
    Some(v.trunc() as i64)
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" | "" => Some(false),
        _ => None,
    }
}

pub struct Parameter {
    value: ParamValue,
    declared: ParamType,
    on_change: Option<ParamCallback>,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("value", &self.value)
            .field("declared", &self.declared)
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

/// A callback still to be run once the registry lock is released.
pub struct ParamChange {
    pub name: String,
    pub value: ParamValue,
    pub callback: Option<ParamCallback>,
}

impl fmt::Debug for ParamChange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ParamChange")
            .field("name", &self.name)
            .field("value", &self.value)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl ParamChange {
    pub fn notify(&self) {
        if let Some(callback) = &self.callback {
            callback(&self.name, &self.value);
        }
    }
}

#[derive(Debug, Default)]
pub struct ParameterRegistry {
    entries: BTreeMap<String, Parameter>,
}

impl ParameterRegistry {
    /// Registers `name`, replacing any earlier entry under the same name.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        value: ParamValue,
        declared: ParamType,
        on_change: Option<ParamCallback>,
    ) -> Result<(), SessionError> {
        let name = name.into();
        let value = value.coerce(declared)?;
        debug!("Registering parameter {} = {} ({})", name, value, declared);
        self.entries.insert(
            name,
            Parameter {
                value,
                declared,
                on_change,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<ParamValue, SessionError> {
        let parameter = self
            .entries
            .get(name)
            .ok_or_else(|| SessionError::ParameterNotFound(name.to_string()))?;
        parameter.value.coerce(parameter.declared)
    }

    pub fn declared_type(&self, name: &str) -> Option<ParamType> {
        self.entries.get(name).map(|p| p.declared)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Applies one `cfg` entry from the server. Unknown names are skipped,
    /// the server can only update parameters the device registered.
    pub fn apply_update(
        &mut self,
        name: &str,
        entry: &Value,
    ) -> Result<Option<ParamChange>, SessionError> {
        let Some(parameter) = self.entries.get_mut(name) else {
            debug!("Ignoring update for unregistered parameter {}", name);
            return Ok(None);
        };

        let malformed = |reason: &str| SessionError::MalformedMessage {
            topic: super::protocol::CONFIG_UPDATE_TOPIC.to_string(),
            reason: format!("parameter {}: {}", name, reason),
        };
        let tag = entry
            .get("t")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing type tag"))?;
        let declared = ParamType::from_tag(tag)
            .ok_or_else(|| malformed(&format!("unknown type tag {:?}", tag)))?;
        let raw = entry.get("v").ok_or_else(|| malformed("missing value"))?;

        let value = ParamValue::from_json(raw, declared)?;
        if declared != parameter.declared {
            warn!(
                "Parameter {} changes type from {} to {}",
                name, parameter.declared, declared
            );
        }
        parameter.declared = declared;
        parameter.value = value.clone();

        Ok(Some(ParamChange {
            name: name.to_string(),
            value,
            callback: parameter.on_change.clone(),
        }))
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        let cfg = self
            .entries
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    ConfigEntry {
                        t: p.declared,
                        v: p.value.clone(),
                    },
                )
            })
            .collect();
        ConfigSnapshot { cfg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn add_coerces_to_declared_type() {
        let mut registry = ParameterRegistry::default();
        registry
            .add("rate", ParamValue::from("15"), ParamType::UInt, None)
            .unwrap();
        registry
            .add("gain", ParamValue::Int(2), ParamType::Float, None)
            .unwrap();
        registry
            .add("led", ParamValue::Int(1), ParamType::Binary, None)
            .unwrap();

        assert_eq!(registry.get("rate").unwrap(), ParamValue::UInt(15));
        assert_eq!(registry.get("gain").unwrap(), ParamValue::Float(2.0));
        assert_eq!(registry.get("led").unwrap(), ParamValue::Binary(true));
    }

    #[test]
    fn add_rejects_values_outside_the_type() {
        let mut registry = ParameterRegistry::default();
        let err = registry
            .add("rate", ParamValue::Int(-1), ParamType::UInt, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::Coercion { target: ParamType::UInt, .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn add_overwrites_previous_entry() {
        let mut registry = ParameterRegistry::default();
        registry.add("mode", "eco".into(), ParamType::String, None).unwrap();
        registry.add("mode", 3i32.into(), ParamType::Int, None).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("mode").unwrap(), ParamValue::Int(3));
    }

    #[test]
    fn get_unknown_parameter_fails() {
        let registry = ParameterRegistry::default();
        assert!(matches!(
            registry.get("missing"),
            Err(SessionError::ParameterNotFound(name)) if name == "missing"
        ));
    }

    #[test]
    fn floats_truncate_into_integers() {
        assert_eq!(
            ParamValue::Float(12.9).coerce(ParamType::Int).unwrap(),
            ParamValue::Int(12)
        );
        assert_eq!(
            ParamValue::Float(-3.7).coerce(ParamType::Int).unwrap(),
            ParamValue::Int(-3)
        );
        assert!(ParamValue::Float(-1.0).coerce(ParamType::UInt).is_err());
        assert!(ParamValue::Float(f64::NAN).coerce(ParamType::Int).is_err());
    }

    #[test]
    fn flags_parse_from_strings() {
        assert_eq!(
            ParamValue::from("On").coerce(ParamType::Binary).unwrap(),
            ParamValue::Binary(true)
        );
        assert_eq!(
            ParamValue::from("0").coerce(ParamType::Binary).unwrap(),
            ParamValue::Binary(false)
        );
        assert!(ParamValue::from("maybe").coerce(ParamType::Binary).is_err());
    }

    #[test]
    fn json_numbers_pick_the_widest_fitting_type() {
        assert_eq!(
            ParamValue::from_json(&json!(3_000_000_000u64), ParamType::UInt).unwrap(),
            ParamValue::UInt(3_000_000_000)
        );
        assert!(ParamValue::from_json(&json!(3_000_000_000u64), ParamType::Int).is_err());
        assert!(ParamValue::from_json(&json!(null), ParamType::String).is_err());
    }

    #[test]
    fn update_changes_type_and_notifies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let callback: ParamCallback = Arc::new(move |name, value| {
            assert_eq!(name, "threshold");
            assert_eq!(value, &ParamValue::Float(2.5));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let mut registry = ParameterRegistry::default();
        registry
            .add("threshold", 1i32.into(), ParamType::Int, Some(callback))
            .unwrap();

        let change = registry
            .apply_update("threshold", &json!({"t": "f64", "v": "2.5"}))
            .unwrap()
            .expect("registered parameter");
        change.notify();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.declared_type("threshold"), Some(ParamType::Float));
        assert_eq!(registry.get("threshold").unwrap(), ParamValue::Float(2.5));
    }

    #[test]
    fn update_for_unknown_name_is_skipped() {
        let mut registry = ParameterRegistry::default();
        let change = registry
            .apply_update("ghost", &json!({"t": "i32", "v": 1}))
            .unwrap();
        assert!(change.is_none());
        assert!(registry.get("ghost").is_err());
    }

    #[test]
    fn update_with_unknown_tag_leaves_parameter_untouched() {
        let mut registry = ParameterRegistry::default();
        registry.add("rate", 5u32.into(), ParamType::UInt, None).unwrap();

        let err = registry
            .apply_update("rate", &json!({"t": "u64", "v": 9}))
            .unwrap_err();
        assert!(matches!(err, SessionError::MalformedMessage { .. }));
        assert_eq!(registry.get("rate").unwrap(), ParamValue::UInt(5));
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let mut registry = ParameterRegistry::default();
        assert!(registry
            .add("x", f64::NAN.into(), ParamType::Float, None)
            .is_err());
        assert!(registry
            .add("y", f64::INFINITY.into(), ParamType::Float, None)
            .is_err());
        assert!(ParamValue::from("inf").coerce(ParamType::Float).is_err());
        assert!(ParamValue::from("NaN").coerce(ParamType::Float).is_err());
        assert!(registry.is_empty());

        registry.add("x", 0.5.into(), ParamType::Float, None).unwrap();
        let err = registry
            .apply_update("x", &json!({"t": "f64", "v": "-inf"}))
            .unwrap_err();
        assert!(matches!(err, SessionError::Coercion { .. }));
        assert_eq!(registry.get("x").unwrap(), ParamValue::Float(0.5));
    }

    #[test]
    fn snapshot_lists_every_parameter() {
        let mut registry = ParameterRegistry::default();
        registry.add("b", true.into(), ParamType::Binary, None).unwrap();
        registry.add("a", "x".into(), ParamType::String, None).unwrap();

        assert_eq!(
            serde_json::to_value(registry.snapshot()).unwrap(),
            json!({"cfg": {
                "a": {"t": "str", "v": "x"},
                "b": {"t": "bin", "v": true}
            }})
        );
    }
}
