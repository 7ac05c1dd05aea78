// src/simulator/mod.rs - In-process motion controller emulator
//!
//! Stands in for the AVR on the other end of the serial link. Commands are
//! executed instantly: motion jumps to its target, dwells take no time and
//! seeks always find their switch. Telemetry goes back as JSON lines, the
//! same way the firmware reports.

use crate::communication::{Command, PauseType};
use crate::hardware::{I2cBus, I2cError, I2cPayload};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Variables the emulated firmware reports in its catalog.
pub const CATALOG: [&str; 19] = [
    "an", "me", "rv", "sa", "tr", "mi", "vm", "am", "jm", "tn", "tm", "sv", "lv", "lb", "zb",
    "fo", "so", "id", "xx",
];

const FIRMWARE_VERSION: &str = "0.4.0-emu";

#[derive(Debug)]
pub struct Emulator {
    vars: Map<String, Value>,
    sync_id: u32,
    holding: bool,
    estopped: bool,
}

impl Emulator {
    pub fn new() -> Self {
        let mut emu = Self {
            vars: Map::new(),
            sync_id: 0,
            holding: false,
            estopped: false,
        };
        emu.power_on();
        emu
    }

    fn power_on(&mut self) {
        self.vars.clear();
        for axis in ["x", "y", "z", "a", "b", "c"] {
            self.vars.insert(format!("{}p", axis), json!(0.0));
        }
        self.vars.insert("xx".into(), json!("READY"));
        self.vars.insert("id".into(), json!(0));
        self.vars.insert("fo".into(), json!(1000));
        self.vars.insert("so".into(), json!(1000));
        self.sync_id = 0;
        self.holding = false;
        self.estopped = false;
    }

    pub fn run_state(&self) -> &str {
        self.vars.get("xx").and_then(Value::as_str).unwrap_or("INIT")
    }

    /// Telemetry sent right after power-on or reboot.
    pub fn boot(&self) -> Vec<String> {
        vec![json!({ "firmware": { "version": FIRMWARE_VERSION } }).to_string()]
    }

    /// Execute one received line and return the telemetry it produces.
    pub fn handle(&mut self, line: &str) -> Vec<String> {
        let cmd = match Command::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::debug!("Emulator rejected '{}': {}", line, e);
                return vec![json!({
                    "msg": format!("Unrecognized command: {}", e),
                    "level": "warning",
                    "where": "emulator",
                })
                .to_string()];
            }
        };

        let mut update = Map::new();
        match cmd {
            Command::Help => {
                return vec![json!({ "variables": CATALOG }).to_string()];
            }
            Command::Dump | Command::Report => {
                return vec![Value::Object(self.vars.clone()).to_string()];
            }
            Command::Reboot => {
                self.power_on();
                return self.boot();
            }
            Command::Set { name, value } => {
                update.insert(name, serde_json::to_value(value).unwrap_or(Value::Null));
            }
            Command::SyncSet { name, value } => {
                if name == "id" {
                    self.sync_id = value.as_f64().unwrap_or(0.0) as u32;
                    return Vec::new();
                }
                update.insert(name, serde_json::to_value(value).unwrap_or(Value::Null));
                self.executed(&mut update);
            }
            Command::SetAxis { axis, position } => {
                update.insert(format!("{}p", axis.letter()), json!(position));
            }
            Command::Line(line) => {
                // A held or stopped controller has discarded its queue.
                if self.holding || self.estopped {
                    return Vec::new();
                }
                for (axis, target) in &line.target {
                    update.insert(format!("{}p", axis.letter()), json!(target));
                }
                if line.id != 0 {
                    self.sync_id = line.id;
                }
                self.executed(&mut update);
            }
            Command::Jog(axes) => {
                for (axis, velocity) in &axes {
                    let key = format!("{}p", axis.letter());
                    let pos = self.vars.get(&key).and_then(Value::as_f64).unwrap_or(0.0);
                    update.insert(key, json!(pos + *velocity as f64));
                }
            }
            Command::Speed(speed) => {
                update.insert("s".into(), json!(speed));
                self.executed(&mut update);
            }
            Command::Dwell(_) | Command::SyncSpeed { .. } => self.executed(&mut update),
            Command::Seek { .. } => {
                self.executed(&mut update);
                self.hold(&mut update, "Switch found");
            }
            Command::Pause(kind) => {
                let reason = match kind {
                    PauseType::User => "User pause",
                    PauseType::Program => "Program pause",
                    PauseType::Optional => "Optional pause",
                    PauseType::PalletChange => "Pallet change",
                };
                if kind != PauseType::User {
                    self.executed(&mut update);
                }
                self.hold(&mut update, reason);
            }
            Command::Stop => self.hold(&mut update, "User stop"),
            Command::Unpause => {
                if self.holding {
                    self.holding = false;
                    update.insert("xx".into(), json!("READY"));
                    update.insert("pr".into(), json!(""));
                }
            }
            Command::Estop => {
                self.estopped = true;
                self.holding = false;
                update.insert("xx".into(), json!("ESTOPPED"));
            }
            Command::Clear => {
                if self.estopped {
                    self.estopped = false;
                    update.insert("xx".into(), json!("READY"));
                }
            }
            Command::Shutdown => {
                update.insert("xx".into(), json!("SHUTDOWN"));
            }
            Command::Resume | Command::Flush => {}
        }
        self.publish(update)
    }

    /// A queued command finished executing.
    fn executed(&self, update: &mut Map<String, Value>) {
        if self.estopped || self.holding {
            return;
        }
        update.insert("id".into(), json!(self.sync_id));
        update.insert("xx".into(), json!("READY"));
    }

    fn hold(&mut self, update: &mut Map<String, Value>, reason: &str) {
        if self.estopped || self.holding {
            return;
        }
        self.holding = true;
        update.insert("xx".into(), json!("HOLDING"));
        update.insert("pr".into(), json!(reason));
    }

    /// Apply `update` and report whatever actually changed.
    fn publish(&mut self, update: Map<String, Value>) -> Vec<String> {
        let mut changed = Map::new();
        for (key, value) in update {
            if self.vars.get(&key) != Some(&value) {
                self.vars.insert(key.clone(), value.clone());
                changed.insert(key, value);
            }
        }
        if changed.is_empty() {
            return Vec::new();
        }
        vec![Value::Object(changed).to_string()]
    }

    /// Serve the emulated device on `io` until the host hangs up. Commands
    /// received over the emulated I2C bus are executed as if they had
    /// arrived on the serial line.
    pub async fn run<S>(mut self, io: S, mut i2c: mpsc::UnboundedReceiver<String>) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(io);
        let mut lines = BufReader::new(reader).lines();
        tracing::info!("Controller emulator started");
        Self::send(&mut writer, self.boot()).await?;

        loop {
            let replies = tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => self.handle(line.trim()),
                    None => break,
                },
                Some(line) = i2c.recv() => self.handle(&line),
            };
            Self::send(&mut writer, replies).await?;
        }
        tracing::info!("Controller emulator stopped");
        Ok(())
    }

    async fn send<W: AsyncWrite + Unpin>(writer: &mut W, lines: Vec<String>) -> std::io::Result<()> {
        for line in lines {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

/// An I2C bus with the emulated controller, a power monitor and an LCD
/// expander on it.
pub struct EmulatedBus {
    avr_address: u8,
    avr: mpsc::UnboundedSender<String>,
    registers: HashMap<(u8, u8), u16>,
}

impl EmulatedBus {
    pub fn new(avr_address: u8, power_address: u8) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        // temp 300K, 36V in and out, small motor and load currents, version 3
        let raw: [u16; 9] = [300, 3600, 3600, 120, 10, 0, 500, 0, 3];
        let registers = raw
            .iter()
            .enumerate()
            .map(|(reg, value)| ((power_address, reg as u8), *value))
            .collect();
        let bus = Self {
            avr_address,
            avr: tx,
            registers,
        };
        (bus, rx)
    }

    /// Change a power monitor register, e.g. to raise a fault flag.
    pub fn set_register(&mut self, addr: u8, reg: u8, value: u16) {
        self.registers.insert((addr, reg), value);
    }
}

impl I2cBus for EmulatedBus {
    fn write(&mut self, addr: u8, cmd: u8, payload: &I2cPayload) -> Result<(), I2cError> {
        if addr != self.avr_address {
            return Ok(());
        }
        let mut line = String::from(cmd as char);
        match payload {
            I2cPayload::None => {}
            I2cPayload::Byte(b) => line.push_str(&b.to_string()),
            I2cPayload::Word(w) => line.push_str(&w.to_string()),
            I2cPayload::Block(data) => line.push_str(&String::from_utf8_lossy(data)),
        }
        self.avr
            .send(line)
            .map_err(|_| I2cError::Bus(format!("no device at 0x{:02x}", addr)))
    }

    fn read_word(&mut self, addr: u8, reg: u8) -> Result<u16, I2cError> {
        self.registers
            .get(&(addr, reg))
            .copied()
            .ok_or_else(|| I2cError::Bus(format!("no register 0x{:02x} at 0x{:02x}", reg, addr)))
    }
}
