// src/state/vars.rs - Typed state values, axes and variable-name resolution
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of motor channels on the controller board.
pub const MOTOR_COUNT: usize = 4;

/// Machine axes in device order. The position in this array is the axis
/// index the device uses for motor-axis assignment (`<motor>an`).
pub const AXES: [Axis; 6] = [Axis::X, Axis::Y, Axis::Z, Axis::A, Axis::B, Axis::C];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
    A,
    B,
    C,
}

impl Axis {
    /// Case-insensitive conversion from an axis letter.
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'x' => Some(Axis::X),
            'y' => Some(Axis::Y),
            'z' => Some(Axis::Z),
            'a' => Some(Axis::A),
            'b' => Some(Axis::B),
            'c' => Some(Axis::C),
            _ => None,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        AXES.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Lowercase letter as used in variable names and on the wire.
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'x',
            Axis::Y => 'y',
            Axis::Z => 'z',
            Axis::A => 'a',
            Axis::B => 'b',
            Axis::C => 'c',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter().to_ascii_uppercase())
    }
}

/// A single machine state variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl StateValue {
    /// Convert a telemetry JSON value. `null` carries no state and yields `None`;
    /// arrays and objects are kept as their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(StateValue::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(StateValue::Number),
            serde_json::Value::String(s) => Some(StateValue::Text(s.clone())),
            other => Some(StateValue::Text(other.to_string())),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            StateValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            StateValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            StateValue::Number(n) => Some(*n != 0.0),
            StateValue::Text(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text form used in `$name=value` / `#name=value` device commands.
    /// Booleans go out as `0`/`1` and integral numbers without a fraction.
    pub fn to_wire(&self) -> String {
        match self {
            StateValue::Bool(b) => String::from(if *b { "1" } else { "0" }),
            StateValue::Number(n) => format_number(*n),
            StateValue::Text(s) => s.clone(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Bool(b) => write!(f, "{}", b),
            StateValue::Number(n) => write!(f, "{}", format_number(*n)),
            StateValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Number(v)
    }
}

impl From<f32> for StateValue {
    fn from(v: f32) -> Self {
        StateValue::Number(v as f64)
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        StateValue::Number(v as f64)
    }
}

impl From<u32> for StateValue {
    fn from(v: u32) -> Self {
        StateValue::Number(v as f64)
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Bool(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Text(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::Text(v)
    }
}

/// A variable name split according to the axis-prefix rule.
///
/// `x_vm` names "the `vm` variable of whichever motor drives X". Names of
/// length three or more whose second character is `_` and whose first is a
/// lowercase axis letter are axis-relative; everything else is used as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarName<'a> {
    Axis { axis: Axis, suffix: &'a str },
    Raw(&'a str),
}

impl<'a> VarName<'a> {
    pub fn parse(name: &'a str) -> Self {
        let bytes = name.as_bytes();
        if bytes.len() > 2 && bytes[1] == b'_' && bytes[0].is_ascii_lowercase() {
            if let Some(axis) = Axis::from_char(bytes[0] as char) {
                return VarName::Axis {
                    axis,
                    suffix: &name[2..],
                };
            }
        }
        VarName::Raw(name)
    }
}

/// Key of a per-motor variable, e.g. `motor_key(2, "vm") == "2vm"`.
pub fn motor_key(motor: usize, suffix: &str) -> String {
    format!("{}{}", motor, suffix)
}

/// How a motor finds its home position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HomingMode {
    Manual,
    SwitchMin,
    SwitchMax,
    StallMin,
    StallMax,
}

impl HomingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(HomingMode::Manual),
            "switch-min" => Some(HomingMode::SwitchMin),
            "switch-max" => Some(HomingMode::SwitchMax),
            "stall-min" => Some(HomingMode::StallMin),
            "stall-max" => Some(HomingMode::StallMax),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HomingMode::Manual => "manual",
            HomingMode::SwitchMin => "switch-min",
            HomingMode::SwitchMax => "switch-max",
            HomingMode::StallMin => "stall-min",
            HomingMode::StallMax => "stall-max",
        }
    }

    /// -1 toward the minimum, 1 toward the maximum, 0 when homed by hand.
    pub fn direction(self) -> f64 {
        match self {
            HomingMode::Manual => 0.0,
            HomingMode::SwitchMin | HomingMode::StallMin => -1.0,
            HomingMode::SwitchMax | HomingMode::StallMax => 1.0,
        }
    }
}
