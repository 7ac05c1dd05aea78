// src/communication/mod.rs - Device link: framing, wire codec, telemetry and sequencing
pub mod codec;
pub mod command_queue;
pub mod link;
pub mod serial;
pub mod telemetry;

pub use codec::{Command, CodecError, LineCommand, PauseType, decode_float, encode_float};
pub use command_queue::CommandQueue;
pub use link::{CommandSource, Link, LinkError};
pub use telemetry::{DeviceLog, LogLevel, Telemetry, TelemetryError};
