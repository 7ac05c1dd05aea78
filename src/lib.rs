// src/lib.rs - Host control plane for a CNC motion controller
pub mod communication;
pub mod config;
pub mod ctrl;
pub mod hardware;
pub mod machine;
pub mod planner;
pub mod simulator;
pub mod state;
pub mod web;

pub use ctrl::{Ctrl, CtrlError};
pub use machine::{Cycle, Mach, MachOp, MachineError, RunState};
pub use state::{Axis, Changes, StateStore, StateValue};
