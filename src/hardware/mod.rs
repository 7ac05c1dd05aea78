// src/hardware/mod.rs - Peripherals on the I2C bus
pub mod i2c;
pub mod lcd;
pub mod power;

pub use i2c::{EmbeddedI2c, I2cBus, I2cDevice, I2cError, I2cPayload, Retry, SharedI2c};
pub use lcd::{Hd44780, LcdDisplay, LcdPage};
pub use power::PowerMonitor;
