// src/machine/cycle.rs - Operating cycles, device run states and pause reasons
use serde::{Deserialize, Serialize};
use std::fmt;

/// The machine's current operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cycle {
    Idle,
    Mdi,
    Jogging,
    Homing,
    Running,
}

impl Cycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Cycle::Idle => "idle",
            Cycle::Mdi => "mdi",
            Cycle::Jogging => "jogging",
            Cycle::Homing => "homing",
            Cycle::Running => "running",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Cycle::Idle),
            "mdi" => Some(Cycle::Mdi),
            "jogging" => Some(Cycle::Jogging),
            "homing" => Some(Cycle::Homing),
            "running" => Some(Cycle::Running),
            _ => None,
        }
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run state reported by the device in `xx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Init,
    Ready,
    Running,
    Stopping,
    Holding,
    Estopped,
}

impl RunState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INIT" => Some(RunState::Init),
            "READY" => Some(RunState::Ready),
            "RUNNING" => Some(RunState::Running),
            "STOPPING" => Some(RunState::Stopping),
            "HOLDING" => Some(RunState::Holding),
            "ESTOPPED" => Some(RunState::Estopped),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Init => "INIT",
            RunState::Ready => "READY",
            RunState::Running => "RUNNING",
            RunState::Stopping => "STOPPING",
            RunState::Holding => "HOLDING",
            RunState::Estopped => "ESTOPPED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the device is holding, from the `pr` variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    UserPause,
    UserStop,
    ProgramPause,
    OptionalPause,
    PalletChange,
    SwitchFound,
    Other(String),
}

impl PauseReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "User pause" => PauseReason::UserPause,
            "User stop" => PauseReason::UserStop,
            "Program pause" => PauseReason::ProgramPause,
            "Optional pause" => PauseReason::OptionalPause,
            "Pallet change" => PauseReason::PalletChange,
            "Switch found" => PauseReason::SwitchFound,
            other => PauseReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PauseReason::UserPause => "User pause",
            PauseReason::UserStop => "User stop",
            PauseReason::ProgramPause => "Program pause",
            PauseReason::OptionalPause => "Optional pause",
            PauseReason::PalletChange => "Pallet change",
            PauseReason::SwitchFound => "Switch found",
            PauseReason::Other(s) => s,
        }
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
