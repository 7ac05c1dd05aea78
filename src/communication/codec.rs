// src/communication/codec.rs - Outbound device command encoding
//!
//! Every command is one ASCII line (the newline is added by the link). The
//! first character selects the command. Numbers inside motion commands use
//! a compact float: the little-endian bytes of an `f32`, base64 encoded,
//! with the two padding characters dropped. That is always six characters.

use crate::state::{Axis, AXES, StateValue};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Length of an encoded float on the wire.
pub const FLOAT_LEN: usize = 6;

/// Number of S-curve segment time slots in a line command.
pub const CURVE_SLOTS: usize = 7;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    UnknownCommand(char),
    #[error("invalid float encoding '{0}'")]
    BadFloat(String),
    #[error("truncated command: {0}")]
    Truncated(String),
    #[error("unexpected '{found}' in {context} command")]
    Unexpected { found: char, context: &'static str },
    #[error("malformed assignment '{0}'")]
    BadAssignment(String),
}

pub fn encode_float(value: f32) -> String {
    let mut s = STANDARD.encode(value.to_le_bytes());
    s.truncate(FLOAT_LEN);
    s
}

pub fn decode_float(s: &str) -> Result<f32, CodecError> {
    if s.len() != FLOAT_LEN {
        return Err(CodecError::BadFloat(s.to_string()));
    }
    let bytes = STANDARD
        .decode(format!("{}==", s))
        .map_err(|_| CodecError::BadFloat(s.to_string()))?;
    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| CodecError::BadFloat(s.to_string()))?;
    Ok(f32::from_le_bytes(bytes))
}

/// Axis values in device order, each as its letter followed by the float.
pub fn encode_axes(axes: &BTreeMap<Axis, f32>) -> String {
    let mut out = String::new();
    for axis in AXES {
        if let Some(v) = axes.get(&axis) {
            out.push(axis.letter());
            out.push_str(&encode_float(*v));
        }
    }
    out
}

/// Why a program pause was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseType {
    User = 0,
    Program = 1,
    Optional = 2,
    PalletChange = 3,
}

impl PauseType {
    pub fn from_digit(d: u8) -> Option<Self> {
        match d {
            0 => Some(PauseType::User),
            1 => Some(PauseType::Program),
            2 => Some(PauseType::Optional),
            3 => Some(PauseType::PalletChange),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineCommand {
    pub id: u32,
    pub exit_vel: f32,
    pub max_accel: f32,
    pub max_jerk: f32,
    pub target: BTreeMap<Axis, f32>,
    /// S-curve segment durations in milliseconds. Zero slots are not sent.
    pub times: [f32; CURVE_SLOTS],
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `$name=value`: persistent device variable.
    Set { name: String, value: StateValue },
    /// `#name=value`: variable applied in sync with queued motion.
    SyncSet { name: String, value: StateValue },
    SetAxis { axis: Axis, position: f32 },
    Line(LineCommand),
    Speed(f32),
    SyncSpeed { dist: f32, speed: f32 },
    Dwell(f32),
    Pause(PauseType),
    Jog(BTreeMap<Axis, f32>),
    Seek { switch: u8, active: bool, error: bool },
    Stop,
    Unpause,
    Report,
    Reboot,
    Resume,
    Estop,
    Shutdown,
    Clear,
    Flush,
    Dump,
    Help,
}

impl Command {
    pub fn set(name: &str, value: impl Into<StateValue>) -> Self {
        Command::Set {
            name: name.to_string(),
            value: value.into(),
        }
    }

    pub fn sync_set(name: &str, value: impl Into<StateValue>) -> Self {
        Command::SyncSet {
            name: name.to_string(),
            value: value.into(),
        }
    }

    /// Digital output on `port`, applied in sync with motion.
    pub fn output(port: u8, value: bool) -> Self {
        Command::sync_set(&format!("{}oa", port), value)
    }

    /// The one-letter control commands, by their wire byte.
    pub fn from_control(code: u8) -> Option<Self> {
        Some(match code {
            b'S' => Command::Stop,
            b'U' => Command::Unpause,
            b'r' => Command::Report,
            b'R' => Command::Reboot,
            b'c' => Command::Resume,
            b'E' => Command::Estop,
            b'X' => Command::Shutdown,
            b'C' => Command::Clear,
            b'F' => Command::Flush,
            b'D' => Command::Dump,
            b'h' => Command::Help,
            _ => return None,
        })
    }

    pub fn encode(&self) -> String {
        match self {
            Command::Set { name, value } => format!("${}={}", name, value.to_wire()),
            Command::SyncSet { name, value } => format!("#{}={}", name, value.to_wire()),
            Command::SetAxis { axis, position } => {
                format!("a{}{}", axis.letter(), encode_float(*position))
            }
            Command::Line(line) => {
                let mut cmd = format!(
                    "#id={}\nl{}{}{}{}",
                    line.id,
                    encode_float(line.exit_vel),
                    encode_float(line.max_accel),
                    encode_float(line.max_jerk),
                    encode_axes(&line.target)
                );
                for (slot, ms) in line.times.iter().enumerate() {
                    if *ms != 0.0 {
                        cmd.push_str(&slot.to_string());
                        cmd.push_str(&encode_float(*ms / 60000.0));
                    }
                }
                cmd
            }
            Command::Speed(speed) => format!("p{}", encode_float(*speed)),
            Command::SyncSpeed { dist, speed } => {
                format!("%t{}{}", encode_float(*dist), encode_float(*speed))
            }
            Command::Dwell(seconds) => format!("d{}", encode_float(*seconds)),
            Command::Pause(kind) => format!("P{}", *kind as u8),
            Command::Jog(axes) => format!("j{}", encode_axes(axes)),
            Command::Seek {
                switch,
                active,
                error,
            } => {
                let flags = u8::from(*active) | (u8::from(*error) << 1);
                format!("s{:x}{}", switch, flags)
            }
            other => match other.control_code() {
                Some(code) => (code as char).to_string(),
                None => String::new(),
            },
        }
    }

    /// Wire byte of a one-letter control command.
    pub fn control_code(&self) -> Option<u8> {
        Some(match self {
            Command::Stop => b'S',
            Command::Unpause => b'U',
            Command::Report => b'r',
            Command::Reboot => b'R',
            Command::Resume => b'c',
            Command::Estop => b'E',
            Command::Shutdown => b'X',
            Command::Clear => b'C',
            Command::Flush => b'F',
            Command::Dump => b'D',
            Command::Help => b'h',
            _ => return None,
        })
    }

    /// Parse one encoded command. A line command is accepted with or
    /// without its `#id=` prefix line.
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let text = text.trim_end_matches('\n');
        if let Some(rest) = text.strip_prefix("#id=") {
            if let Some((id, line)) = rest.split_once('\n') {
                let id = id
                    .parse()
                    .map_err(|_| CodecError::BadAssignment(text.to_string()))?;
                return match Command::parse(line)? {
                    Command::Line(mut l) => {
                        l.id = id;
                        Ok(Command::Line(l))
                    }
                    _ => Err(CodecError::Truncated(text.to_string())),
                };
            }
        }

        let mut chars = text.chars();
        let sigil = chars.next().ok_or(CodecError::Empty)?;
        let body = chars.as_str();
        match sigil {
            '$' => {
                let (name, value) = parse_assignment(body)?;
                Ok(Command::Set { name, value })
            }
            '#' => {
                let (name, value) = parse_assignment(body)?;
                Ok(Command::SyncSet { name, value })
            }
            'a' => {
                let mut r = Reader::new(body, "set-axis");
                let axis = r.axis()?;
                let position = r.float()?;
                r.finish()?;
                Ok(Command::SetAxis { axis, position })
            }
            'l' => parse_line(body).map(Command::Line),
            'p' => {
                let mut r = Reader::new(body, "speed");
                let speed = r.float()?;
                r.finish()?;
                Ok(Command::Speed(speed))
            }
            '%' => {
                let mut r = Reader::new(body, "sync-speed");
                r.expect('t')?;
                let dist = r.float()?;
                let speed = r.float()?;
                r.finish()?;
                Ok(Command::SyncSpeed { dist, speed })
            }
            'd' => {
                let mut r = Reader::new(body, "dwell");
                let seconds = r.float()?;
                r.finish()?;
                Ok(Command::Dwell(seconds))
            }
            'P' => {
                let digit = body
                    .parse::<u8>()
                    .ok()
                    .and_then(PauseType::from_digit)
                    .ok_or_else(|| CodecError::Truncated(text.to_string()))?;
                Ok(Command::Pause(digit))
            }
            'j' => {
                let mut r = Reader::new(body, "jog");
                let mut axes = BTreeMap::new();
                while !r.is_empty() {
                    let axis = r.axis()?;
                    axes.insert(axis, r.float()?);
                }
                Ok(Command::Jog(axes))
            }
            's' => {
                let mut r = Reader::new(body, "seek");
                let switch = r.hex_digit()?;
                let flags = r.hex_digit()?;
                r.finish()?;
                Ok(Command::Seek {
                    switch,
                    active: flags & 1 != 0,
                    error: flags & 2 != 0,
                })
            }
            c if body.is_empty() && c.is_ascii() => {
                Command::from_control(c as u8).ok_or(CodecError::UnknownCommand(c))
            }
            c => Err(CodecError::UnknownCommand(c)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn parse_assignment(body: &str) -> Result<(String, StateValue), CodecError> {
    let (name, value) = body
        .split_once('=')
        .ok_or_else(|| CodecError::BadAssignment(body.to_string()))?;
    if name.is_empty() {
        return Err(CodecError::BadAssignment(body.to_string()));
    }
    let value = match value.parse::<f64>() {
        Ok(n) => StateValue::Number(n),
        Err(_) => StateValue::Text(value.to_string()),
    };
    Ok((name.to_string(), value))
}

fn parse_line(body: &str) -> Result<LineCommand, CodecError> {
    let mut r = Reader::new(body, "line");
    let exit_vel = r.float()?;
    let max_accel = r.float()?;
    let max_jerk = r.float()?;
    let mut target = BTreeMap::new();
    let mut times = [0.0; CURVE_SLOTS];
    while let Some(c) = r.peek() {
        if let Some(axis) = Axis::from_char(c).filter(|_| c.is_ascii_lowercase()) {
            r.bump();
            target.insert(axis, r.float()?);
        } else if let Some(slot) = c.to_digit(10).filter(|d| (*d as usize) < CURVE_SLOTS) {
            r.bump();
            times[slot as usize] = r.float()? * 60000.0;
        } else {
            return Err(CodecError::Unexpected {
                found: c,
                context: "line",
            });
        }
    }
    Ok(LineCommand {
        id: 0,
        exit_vel,
        max_accel,
        max_jerk,
        target,
        times,
    })
}

/// Cursor over the body of a compact command.
struct Reader<'a> {
    rest: &'a str,
    context: &'static str,
}

impl<'a> Reader<'a> {
    fn new(rest: &'a str, context: &'static str) -> Self {
        Self { rest, context }
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn peek(&self) -> Option<char> {
        self.rest.chars().next()
    }

    fn bump(&mut self) {
        let mut chars = self.rest.chars();
        chars.next();
        self.rest = chars.as_str();
    }

    fn next_char(&mut self) -> Result<char, CodecError> {
        let c = self
            .peek()
            .ok_or_else(|| CodecError::Truncated(self.context.to_string()))?;
        self.bump();
        Ok(c)
    }

    fn expect(&mut self, want: char) -> Result<(), CodecError> {
        match self.next_char()? {
            c if c == want => Ok(()),
            found => Err(CodecError::Unexpected {
                found,
                context: self.context,
            }),
        }
    }

    fn axis(&mut self) -> Result<Axis, CodecError> {
        let c = self.next_char()?;
        Axis::from_char(c)
            .filter(|_| c.is_ascii_lowercase())
            .ok_or(CodecError::Unexpected {
                found: c,
                context: self.context,
            })
    }

    fn hex_digit(&mut self) -> Result<u8, CodecError> {
        let c = self.next_char()?;
        c.to_digit(16).map(|d| d as u8).ok_or(CodecError::Unexpected {
            found: c,
            context: self.context,
        })
    }

    fn float(&mut self) -> Result<f32, CodecError> {
        if !self.rest.is_char_boundary(FLOAT_LEN.min(self.rest.len()))
            || self.rest.len() < FLOAT_LEN
        {
            return Err(CodecError::Truncated(self.context.to_string()));
        }
        let (head, tail) = self.rest.split_at(FLOAT_LEN);
        self.rest = tail;
        decode_float(head)
    }

    fn finish(&self) -> Result<(), CodecError> {
        match self.peek() {
            None => Ok(()),
            Some(found) => Err(CodecError::Unexpected {
                found,
                context: self.context,
            }),
        }
    }
}
