// src/ctrl.rs - Controller context and the reactor loop that drives it
//!
//! [`Ctrl`] owns everything that runs on the controller task: the machine
//! orchestrator, the I2C peripherals and the change broadcast. [`Ctrl::run`]
//! is the only place that waits. It multiplexes port reads, port writes
//! (only while output is pending), the earliest timer deadline and web
//! requests, then hands each event to the synchronous core.

use crate::communication::LinkError;
use crate::communication::serial::DevicePort;
use crate::config::{Config, ConfigError};
use crate::hardware::{Hd44780, I2cDevice, LcdDisplay, LcdPage, PowerMonitor, Retry, SharedI2c};
use crate::machine::Mach;
use crate::planner::PathPlanner;
use crate::state::{Changes, ListenerResult};
use crate::web::ctrl_channel::CtrlRequest;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Error)]
pub enum CtrlError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

const READ_BUFFER: usize = 4096;
const EVENT_CAPACITY: usize = 64;
/// Upper bound on how long the loop sleeps with no timer pending.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

pub struct Ctrl {
    mach: Mach,
    power: Option<PowerMonitor>,
    lcd: Option<Box<dyn LcdDisplay>>,
    page: LcdPage,
    events: broadcast::Sender<Changes>,
    power_at: Option<Instant>,
}

impl Ctrl {
    /// Build the controller. Without a bus, or with I2C disabled, control
    /// commands go over serial and the power monitor and LCD are absent.
    pub fn new(
        config: Config,
        planner: Box<dyn PathPlanner>,
        bus: Option<SharedI2c>,
    ) -> Result<Self, CtrlError> {
        config.validate()?;
        let bus = bus.filter(|_| config.i2c.enabled);
        let device = |bus: &SharedI2c, addr: u8| I2cDevice::new(bus.clone(), addr);
        let avr = bus.as_ref().map(|b| device(b, config.i2c.avr_address));
        let power = bus.as_ref().map(|b| {
            PowerMonitor::new(
                device(b, config.i2c.power_address),
                config.timing.power_poll(),
                Retry::new(config.i2c.retries, config.i2c.retry_delay()),
            )
        });
        let lcd = bus
            .as_ref()
            .map(|b| Box::new(Hd44780::new(device(b, config.i2c.lcd_address))) as Box<dyn LcdDisplay>);
        if bus.is_none() {
            tracing::info!("No I2C bus, control commands go over serial");
        }

        let mut mach = Mach::new(config, planner, avr);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tx = events.clone();
        mach.state_mut().add_listener(Box::new(move |changes: &Changes| -> ListenerResult {
            // No subscribers is not an error.
            let _ = tx.send(changes.clone());
            Ok(())
        }));

        Ok(Self {
            mach,
            power_at: power.as_ref().map(|_| Instant::now()),
            power,
            lcd,
            page: LcdPage::new(),
            events,
        })
    }

    pub fn mach(&self) -> &Mach {
        &self.mach
    }

    pub fn mach_mut(&mut self) -> &mut Mach {
        &mut self.mach
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Changes> {
        self.events.subscribe()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.mach.next_deadline(), self.power_at]
            .into_iter()
            .flatten()
            .min()
    }

    /// Run every timer due at `now`.
    pub fn on_timer(&mut self, now: Instant) {
        if self.mach.poll(now).is_some() {
            self.update_lcd();
        }
        if self.power_at.is_some_and(|at| at <= now) {
            self.power_at = self
                .power
                .as_mut()
                .map(|power| power.poll(self.mach.state_mut(), now));
        }
    }

    fn update_lcd(&mut self) {
        let Some(lcd) = self.lcd.as_mut() else {
            return;
        };
        match &self.power {
            Some(power) if power.flags() != 0 => power.render(&mut self.page),
            _ => self.page.render_status(self.mach.state()),
        }
        if let Err(e) = lcd.show(&self.page) {
            tracing::warn!("LCD update failed: {}", e);
        }
    }

    pub fn handle_request(&mut self, request: CtrlRequest) {
        match request {
            CtrlRequest::GetState { respond_to } => {
                let _ = respond_to.send(self.mach.state().snapshot());
            }
            CtrlRequest::Subscribe { respond_to } => {
                let _ = respond_to.send((self.mach.state().snapshot(), self.events.subscribe()));
            }
            CtrlRequest::Command { op, respond_to } => {
                tracing::debug!("Request: {:?}", op);
                let result = self.mach.execute(op).map_err(|e| {
                    tracing::warn!("Request refused: {}", e);
                    e.to_string()
                });
                let _ = respond_to.send(result);
            }
        }
    }

    /// Drive the controller until the request channel closes. A missing or
    /// failed port leaves the controller running with output discarded.
    pub async fn run(
        mut self,
        port: Option<DevicePort>,
        mut requests: mpsc::Receiver<CtrlRequest>,
    ) -> Result<(), CtrlError> {
        let (mut reader, mut writer) = match port {
            Some(port) => {
                let (r, w) = tokio::io::split(port);
                (Some(r), Some(w))
            }
            None => (None, None),
        };
        self.mach.set_link_attached(reader.is_some());
        self.mach.connect();

        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            let out = if self.mach.wants_write() {
                self.mach.pending_output().map(<[u8]>::to_vec)
            } else {
                None
            };
            let deadline = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);

            tokio::select! {
                result = read_port(&mut reader, &mut buf) => match result {
                    Ok(0) => self.detach(&mut reader, &mut writer, LinkError::Closed),
                    Ok(n) => self.mach.receive(&buf[..n]),
                    Err(e) => self.detach(&mut reader, &mut writer, e.into()),
                },
                result = write_port(&mut writer, out.as_deref()) => match result {
                    Ok(0) => self.detach(&mut reader, &mut writer, LinkError::Closed),
                    Ok(n) => self.mach.advance_output(n),
                    Err(e) => self.detach(&mut reader, &mut writer, e.into()),
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    self.on_timer(Instant::now());
                }
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
            }
        }

        tracing::info!("Controller shutting down");
        if let Some(mut writer) = writer {
            writer.shutdown().await?;
        }
        Ok(())
    }

    fn detach(
        &mut self,
        reader: &mut Option<ReadHalf<DevicePort>>,
        writer: &mut Option<WriteHalf<DevicePort>>,
        err: LinkError,
    ) {
        tracing::error!("Serial port lost, continuing without device");
        *reader = None;
        *writer = None;
        self.mach.set_link_attached(false);
        self.mach.io_error(&err);
    }
}

async fn read_port(
    reader: &mut Option<ReadHalf<DevicePort>>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn write_port(
    writer: &mut Option<WriteHalf<DevicePort>>,
    data: Option<&[u8]>,
) -> std::io::Result<usize> {
    match (writer, data) {
        // `write` is cancel safe.
        (Some(w), Some(data)) => w.write(data).await,
        _ => std::future::pending().await,
    }
}
