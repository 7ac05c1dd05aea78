// src/hardware/power.rs - Power supply monitor polled over I2C
use super::i2c::{I2cDevice, I2cError, Retry};
use super::lcd::LcdPage;
use crate::state::StateStore;
use std::time::{Duration, Instant};

pub const DEFAULT_ADDRESS: u8 = 0x60;

/// Monitor registers, by register index.
const REGISTERS: [(&str, Scale); 9] = [
    ("temp", Scale::Kelvin),
    ("vin", Scale::Centi),
    ("vout", Scale::Centi),
    ("motor", Scale::Centi),
    ("load1", Scale::Centi),
    ("load2", Scale::Centi),
    ("vdd", Scale::Centi),
    ("pwr_flags", Scale::Raw),
    ("pwr_version", Scale::Raw),
];

const FLAGS_REG: usize = 7;

#[derive(Debug, Clone, Copy)]
enum Scale {
    Kelvin,
    Centi,
    Raw,
}

impl Scale {
    fn apply(self, raw: u16) -> f64 {
        match self {
            Scale::Kelvin => raw as f64 - 273.0,
            Scale::Centi => raw as f64 / 100.0,
            Scale::Raw => raw as f64,
        }
    }
}

/// Fault bits of the flags register, low bit first.
pub const FAULT_FLAGS: [&str; 16] = [
    "under_voltage",
    "over_voltage",
    "over_current",
    "sense_error",
    "shunt_overload",
    "motor_overload",
    "load1_shutdown",
    "load2_shutdown",
    "motor_under_voltage",
    "motor_voltage_sense_error",
    "motor_current_sense_error",
    "load1_sense_error",
    "load2_sense_error",
    "vdd_current_sense_error",
    "power_shutdown",
    "shunt_error",
];

/// Names of the flags set in `flags`.
pub fn decode_flags(flags: u16) -> Vec<&'static str> {
    FAULT_FLAGS
        .iter()
        .enumerate()
        .filter(|(bit, _)| flags & (1 << bit) != 0)
        .map(|(_, name)| *name)
        .collect()
}

#[derive(Debug)]
pub struct PowerMonitor {
    dev: I2cDevice,
    period: Duration,
    retry: Retry,
    values: [Option<f64>; REGISTERS.len()],
    flags: u16,
    failures: u32,
}

impl PowerMonitor {
    pub fn new(dev: I2cDevice, period: Duration, retry: Retry) -> Self {
        Self {
            dev,
            period,
            retry,
            values: [None; REGISTERS.len()],
            flags: 0,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Read every register and publish the values. Returns when to poll
    /// next: one period on, or sooner while a failed read is being retried.
    /// A round whose attempts all fail is counted and logged.
    pub fn poll(&mut self, state: &mut StateStore, now: Instant) -> Instant {
        let e = match self.read_all(state) {
            Ok(()) => {
                self.retry.succeeded();
                self.failures = 0;
                return now + self.period;
            }
            Err(e) => e,
        };
        if let Some(at) = self.retry.failed(now) {
            tracing::debug!("Power monitor read failed, retrying: {}", e);
            return at;
        }
        self.failures += 1;
        if self.failures == 1 || self.failures % 10 == 0 {
            tracing::warn!("Power monitor read failed ({}x): {}", self.failures, e);
        }
        now + self.period
    }

    fn read_all(&mut self, state: &mut StateStore) -> Result<(), I2cError> {
        for (reg, (name, scale)) in REGISTERS.iter().enumerate() {
            let raw = self.dev.read_word(reg as u8)?;
            if reg == FLAGS_REG {
                self.update_flags(raw, state);
            }
            let value = scale.apply(raw);
            self.values[reg] = Some(value);
            state.set(name, value);
        }
        Ok(())
    }

    fn update_flags(&mut self, flags: u16, state: &mut StateStore) {
        let changed = flags ^ self.flags;
        for (bit, name) in FAULT_FLAGS.iter().enumerate() {
            let mask = 1u16 << bit;
            if changed & mask == 0 {
                continue;
            }
            let set = flags & mask != 0;
            if set {
                tracing::error!("Power fault: {}", name);
            } else {
                tracing::info!("Power fault cleared: {}", name);
            }
            state.set(name, set);
        }
        self.flags = flags;
    }

    pub fn render(&self, page: &mut LcdPage) {
        let get = |reg: usize| self.values[reg].unwrap_or(f64::NAN);
        page.clear();
        page.text(&format!("Temp:{:5.1}C", get(0)), 0, 0);
        page.text(&format!("In:{:5.1}V Out:{:5.1}V", get(1), get(2)), 0, 1);
        page.text(&format!("Motor:{:5.2}A", get(3)), 0, 2);
        page.text(&format!("L1:{:4.2}A L2:{:4.2}A", get(4), get(5)), 0, 3);
    }
}
