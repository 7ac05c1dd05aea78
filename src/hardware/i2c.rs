// src/hardware/i2c.rs - I2C command interface and non-blocking retry
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum I2cError {
    #[error("I2C bus error: {0}")]
    Bus(String),
    #[error("I2C device 0x{addr:02x}: {message}")]
    Device { addr: u8, message: String },
    #[error("cannot open I2C bus {path}: {message}")]
    Open { path: String, message: String },
}

/// Data following the command byte of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum I2cPayload {
    None,
    Byte(u8),
    /// Sent little-endian.
    Word(u16),
    Block(Vec<u8>),
}

impl I2cPayload {
    fn append_to(&self, buf: &mut Vec<u8>) {
        match self {
            I2cPayload::None => {}
            I2cPayload::Byte(b) => buf.push(*b),
            I2cPayload::Word(w) => buf.extend_from_slice(&w.to_le_bytes()),
            I2cPayload::Block(data) => buf.extend_from_slice(data),
        }
    }
}

/// A 7-bit addressed command bus.
pub trait I2cBus {
    fn write(&mut self, addr: u8, cmd: u8, payload: &I2cPayload) -> Result<(), I2cError>;
    fn read_word(&mut self, addr: u8, reg: u8) -> Result<u16, I2cError>;
}

/// The bus is shared by every device on it; all access is from one thread.
pub type SharedI2c = Rc<RefCell<dyn I2cBus>>;

pub fn shared<B: I2cBus + 'static>(bus: B) -> SharedI2c {
    Rc::new(RefCell::new(bus))
}

/// Open a Linux I2C character device such as `/dev/i2c-1`.
#[cfg(target_os = "linux")]
pub fn open(path: &str) -> Result<SharedI2c, I2cError> {
    let dev = linux_embedded_hal::I2cdev::new(path).map_err(|e| I2cError::Open {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    Ok(shared(EmbeddedI2c::new(dev)))
}

#[cfg(not(target_os = "linux"))]
pub fn open(path: &str) -> Result<SharedI2c, I2cError> {
    Err(I2cError::Open {
        path: path.to_string(),
        message: "I2C devices are only supported on Linux".into(),
    })
}

/// Open the configured bus, or carry on without one.
pub fn open_or_degraded(path: &str) -> Option<SharedI2c> {
    match open(path) {
        Ok(bus) => {
            tracing::info!("Opened I2C bus {}", path);
            Some(bus)
        }
        Err(e) => {
            tracing::warn!("{}. Continuing without I2C peripherals", e);
            None
        }
    }
}

/// Any `embedded-hal` I2C implementation.
pub struct EmbeddedI2c<T> {
    bus: T,
}

impl<T> EmbeddedI2c<T> {
    pub fn new(bus: T) -> Self {
        Self { bus }
    }
}

impl<T: embedded_hal::i2c::I2c> I2cBus for EmbeddedI2c<T> {
    fn write(&mut self, addr: u8, cmd: u8, payload: &I2cPayload) -> Result<(), I2cError> {
        use embedded_hal::i2c::Error as _;
        let mut buf = vec![cmd];
        payload.append_to(&mut buf);
        self.bus
            .write(addr, &buf)
            .map_err(|e| I2cError::Bus(format!("{:?}", e.kind())))
    }

    fn read_word(&mut self, addr: u8, reg: u8) -> Result<u16, I2cError> {
        use embedded_hal::i2c::Error as _;
        let mut word = [0u8; 2];
        self.bus
            .write_read(addr, &[reg], &mut word)
            .map_err(|e| I2cError::Bus(format!("{:?}", e.kind())))?;
        Ok(u16::from_le_bytes(word))
    }
}

/// One device on a shared bus. Each call is a single transfer; callers
/// that want another attempt schedule it with [`Retry`].
#[derive(Clone)]
pub struct I2cDevice {
    bus: SharedI2c,
    addr: u8,
}

impl I2cDevice {
    pub fn new(bus: SharedI2c, addr: u8) -> Self {
        Self { bus, addr }
    }

    pub fn addr(&self) -> u8 {
        self.addr
    }

    fn transfer<R>(
        &self,
        op: impl FnOnce(&mut dyn I2cBus) -> Result<R, I2cError>,
    ) -> Result<R, I2cError> {
        let result = {
            let mut bus = self.bus.borrow_mut();
            op(&mut *bus)
        };
        result.map_err(|e| I2cError::Device {
            addr: self.addr,
            message: e.to_string(),
        })
    }

    pub fn write(&self, cmd: u8, payload: I2cPayload) -> Result<(), I2cError> {
        let addr = self.addr;
        self.transfer(|bus| bus.write(addr, cmd, &payload))
    }

    pub fn read_word(&self, reg: u8) -> Result<u16, I2cError> {
        let addr = self.addr;
        self.transfer(|bus| bus.read_word(addr, reg))
    }
}

impl std::fmt::Debug for I2cDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("I2cDevice")
            .field("addr", &format_args!("0x{:02x}", self.addr))
            .finish()
    }
}

/// Bounded retry for a periodic poller. The next attempt is a deadline for
/// the event loop, never a sleep.
#[derive(Debug, Clone)]
pub struct Retry {
    attempts: u32,
    delay: Duration,
    failed: u32,
}

impl Retry {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            failed: 0,
        }
    }

    /// A transfer failed at `now`. Returns when to try again, or `None`
    /// once every attempt of this round has failed.
    pub fn failed(&mut self, now: Instant) -> Option<Instant> {
        self.failed += 1;
        if self.failed < self.attempts {
            Some(now + self.delay)
        } else {
            self.failed = 0;
            None
        }
    }

    pub fn succeeded(&mut self) {
        self.failed = 0;
    }

    /// Failed attempts in the current round.
    pub fn pending(&self) -> u32 {
        self.failed
    }
}
