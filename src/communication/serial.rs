// src/communication/serial.rs - Opening the controller's serial port
use crate::config::SerialConfig;
use serial2_tokio::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};
use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex byte stream the controller can be reached over.
pub trait DeviceIo: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin> DeviceIo for T {}

pub type DevicePort = Box<dyn DeviceIo>;

/// Open the serial device in raw 8N1 mode.
pub fn open(config: &SerialConfig) -> std::io::Result<SerialPort> {
    let baud = config.baud;
    let rtscts = config.rtscts;
    SerialPort::open(&config.port, move |mut settings: Settings| {
        settings.set_raw();
        settings.set_baud_rate(baud)?;
        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::One);
        settings.set_parity(Parity::None);
        settings.set_flow_control(if rtscts {
            FlowControl::RtsCts
        } else {
            FlowControl::None
        });
        Ok(settings)
    })
}

/// Open the serial device, or `None` to run without one. A failure is
/// logged and is not fatal.
pub fn open_or_degraded(config: &SerialConfig) -> Option<DevicePort> {
    match open(config) {
        Ok(port) => {
            tracing::info!("Opened {} at {} baud", config.port, config.baud);
            Some(Box::new(port))
        }
        Err(e) => {
            tracing::warn!(
                "Failed to open serial port {}: {}. Continuing without a controller",
                config.port,
                e
            );
            None
        }
    }
}
