// src/hardware/lcd.rs - Character LCD pages
use super::i2c::{I2cDevice, I2cError, I2cPayload};
use crate::state::{AXES, StateStore};

pub const LCD_WIDTH: usize = 20;
pub const LCD_HEIGHT: usize = 4;
pub const DEFAULT_ADDRESS: u8 = 0x27;

/// A screenful of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcdPage {
    rows: [[u8; LCD_WIDTH]; LCD_HEIGHT],
}

impl LcdPage {
    pub fn new() -> Self {
        Self {
            rows: [[b' '; LCD_WIDTH]; LCD_HEIGHT],
        }
    }

    pub fn clear(&mut self) {
        self.rows = [[b' '; LCD_WIDTH]; LCD_HEIGHT];
    }

    /// Write `msg` at column `x` of row `y`, clipped to the screen.
    /// Non-ASCII characters are shown as `?`.
    pub fn text(&mut self, msg: &str, x: usize, y: usize) {
        let Some(row) = self.rows.get_mut(y) else {
            return;
        };
        for (col, c) in (x..LCD_WIDTH).zip(msg.chars()) {
            row[col] = if c.is_ascii() && !c.is_ascii_control() {
                c as u8
            } else {
                b'?'
            };
        }
    }

    pub fn row(&self, y: usize) -> String {
        self.rows
            .get(y)
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<String> {
        (0..LCD_HEIGHT).map(|y| self.row(y)).collect()
    }

    /// The default page: run state, cycle and up to three axis positions.
    pub fn render_status(&mut self, state: &StateStore) {
        self.clear();
        self.text(&state.get_str("xx", "INIT"), 0, 0);
        let cycle = state.get_str("cycle", "idle").to_uppercase();
        self.text(&cycle, LCD_WIDTH.saturating_sub(cycle.len()), 0);
        let mut row = 1;
        for axis in AXES {
            if row >= LCD_HEIGHT {
                break;
            }
            if !state.is_axis_enabled(axis) {
                continue;
            }
            let pos = state.get_f64(&format!("{}p", axis.letter()), 0.0);
            let homed = if state.is_axis_homed(axis) { 'H' } else { ' ' };
            self.text(&format!("{}{:10.3} {}", axis, pos, homed), 0, row);
            row += 1;
        }
    }
}

impl Default for LcdPage {
    fn default() -> Self {
        Self::new()
    }
}

pub trait LcdDisplay {
    fn show(&mut self, page: &LcdPage) -> Result<(), I2cError>;
}

/// HD44780 controller behind a PCF8574 I2C expander, driven in 4-bit mode.
#[derive(Debug)]
pub struct Hd44780 {
    dev: I2cDevice,
    initialized: bool,
    shown: Option<LcdPage>,
}

const BACKLIGHT: u8 = 0x08;
const ENABLE: u8 = 0x04;
const REGISTER_SELECT: u8 = 0x01;
const ROW_OFFSETS: [u8; LCD_HEIGHT] = [0x00, 0x40, 0x14, 0x54];

impl Hd44780 {
    pub fn new(dev: I2cDevice) -> Self {
        Self {
            dev,
            initialized: false,
            shown: None,
        }
    }

    fn strobe(&self, data: u8) -> Result<(), I2cError> {
        self.dev.write(data | BACKLIGHT | ENABLE, I2cPayload::None)?;
        self.dev.write((data | BACKLIGHT) & !ENABLE, I2cPayload::None)
    }

    fn send(&self, byte: u8, mode: u8) -> Result<(), I2cError> {
        self.strobe((byte & 0xf0) | mode)?;
        self.strobe(((byte << 4) & 0xf0) | mode)
    }

    fn init(&mut self) -> Result<(), I2cError> {
        for nibble in [0x30, 0x30, 0x30, 0x20] {
            self.strobe(nibble)?;
        }
        // 4-bit, two lines; display on; entry left; clear
        for cmd in [0x28, 0x0c, 0x06, 0x01] {
            self.send(cmd, 0)?;
        }
        self.initialized = true;
        Ok(())
    }

    fn write_page(&self, page: &LcdPage) -> Result<(), I2cError> {
        for (y, offset) in ROW_OFFSETS.iter().enumerate() {
            self.send(0x80 | offset, 0)?;
            for b in page.rows[y] {
                self.send(b, REGISTER_SELECT)?;
            }
        }
        Ok(())
    }
}

impl LcdDisplay for Hd44780 {
    fn show(&mut self, page: &LcdPage) -> Result<(), I2cError> {
        if self.shown.as_ref() == Some(page) {
            return Ok(());
        }
        if !self.initialized {
            if let Err(e) = self.init() {
                self.shown = None;
                return Err(e);
            }
        }
        let result = self.write_page(page);
        match result {
            Ok(()) => self.shown = Some(page.clone()),
            Err(_) => {
                self.initialized = false;
                self.shown = None;
            }
        }
        result
    }
}
