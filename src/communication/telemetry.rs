// src/communication/telemetry.rs - Inbound JSON telemetry from the device
use crate::state::StateValue;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid telemetry JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("telemetry is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Self {
        match s {
            "debug" => LogLevel::Debug,
            "warning" | "warn" => LogLevel::Warning,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLog {
    pub msg: String,
    pub level: LogLevel,
    pub location: Option<String>,
}

impl DeviceLog {
    /// Re-emit through tracing under the `avr` target.
    pub fn emit(&self) {
        let location = self.location.as_deref().unwrap_or("");
        match self.level {
            LogLevel::Debug => tracing::debug!(target: "avr", location, "{}", self.msg),
            LogLevel::Info => tracing::info!(target: "avr", location, "{}", self.msg),
            LogLevel::Warning => tracing::warn!(target: "avr", location, "{}", self.msg),
            LogLevel::Error => tracing::error!(target: "avr", location, "{}", self.msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    /// Variable catalog; the device has (re)announced what it understands.
    Variables(Vec<String>),
    Log(DeviceLog),
    /// The device firmware has just booted.
    Firmware(Value),
    Update(Vec<(String, StateValue)>),
}

impl Telemetry {
    pub fn decode(line: &str) -> Result<Self, TelemetryError> {
        let value: Value = serde_json::from_str(line)?;
        let Value::Object(mut map) = value else {
            return Err(TelemetryError::NotAnObject);
        };

        if let Some(vars) = map.remove("variables") {
            let codes = match vars {
                Value::Object(obj) => obj.into_iter().map(|(k, _)| k).collect(),
                Value::Array(items) => items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
            return Ok(Telemetry::Variables(codes));
        }

        if let Some(msg) = map.get("msg") {
            let msg = match msg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let level = map
                .get("level")
                .and_then(Value::as_str)
                .map(LogLevel::parse)
                .unwrap_or(LogLevel::Info);
            let location = map.get("where").and_then(Value::as_str).map(str::to_string);
            return Ok(Telemetry::Log(DeviceLog {
                msg,
                level,
                location,
            }));
        }

        if let Some(firmware) = map.remove("firmware") {
            return Ok(Telemetry::Firmware(firmware));
        }

        let update = map
            .iter()
            .filter_map(|(k, v)| StateValue::from_json(v).map(|v| (k.clone(), v)))
            .collect();
        Ok(Telemetry::Update(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_update() {
        let t = Telemetry::decode(r#"{"xx":"READY","xp":1.5,"skip":null}"#).unwrap();
        let Telemetry::Update(update) = t else {
            panic!("expected update");
        };
        assert_eq!(update.len(), 2);
        assert!(update.contains(&("xx".to_string(), StateValue::from("READY"))));
    }

    #[test]
    fn test_log_message() {
        let t = Telemetry::decode(r#"{"msg":"Overheat","level":"error","where":"motor.c:12"}"#)
            .unwrap();
        assert_eq!(
            t,
            Telemetry::Log(DeviceLog {
                msg: "Overheat".into(),
                level: LogLevel::Error,
                location: Some("motor.c:12".into()),
            })
        );
    }

    #[test]
    fn test_catalog_and_firmware() {
        match Telemetry::decode(r#"{"variables":{"vm":{},"an":{}}}"#).unwrap() {
            Telemetry::Variables(mut codes) => {
                codes.sort();
                assert_eq!(codes, vec!["an", "vm"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            Telemetry::decode(r#"{"firmware":{"version":"1.0"}}"#).unwrap(),
            Telemetry::Firmware(_)
        ));
    }

    #[test]
    fn test_malformed() {
        assert!(Telemetry::decode("{\"xx\":").is_err());
        assert!(matches!(
            Telemetry::decode("[1,2]"),
            Err(TelemetryError::NotAnObject)
        ));
    }
}
