// src/machine/comm.rs - Outbound command paths to the motion controller
use crate::communication::{Command, CommandSource, Link};
use crate::hardware::{I2cDevice, I2cPayload};
use crate::state::StateValue;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Payload of the command queue, applied when released.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedAction {
    SetState { name: String, value: StateValue },
    Message(String),
    /// A device command that must follow everything queued before it.
    Send(String),
    /// Announce ourselves to a freshly (re)started device.
    Resync,
}

/// Serial output sources in priority order.
struct Outbox<'a, P> {
    admin: &'a mut VecDeque<String>,
    released: &'a mut VecDeque<String>,
    motion: Option<P>,
}

impl<P: CommandSource> CommandSource for Outbox<'_, P> {
    fn next_command(&mut self) -> Option<String> {
        if let Some(cmd) = self.admin.pop_front() {
            return Some(cmd);
        }
        if let Some(cmd) = self.released.pop_front() {
            return Some(cmd);
        }
        self.motion.as_mut().and_then(|m| m.next_command())
    }
}

/// Owns the serial link and the optional I2C side channel to the same
/// controller.
#[derive(Debug)]
pub struct Comm {
    link: Link,
    admin: VecDeque<String>,
    released: VecDeque<String>,
    avr: Option<I2cDevice>,
    reconnect_at: Option<Instant>,
    reconnect_delay: Duration,
}

impl Comm {
    pub fn new(avr: Option<I2cDevice>, reconnect_delay: Duration) -> Self {
        Self {
            link: Link::new(),
            admin: VecDeque::new(),
            released: VecDeque::new(),
            avr,
            reconnect_at: None,
            reconnect_delay,
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }

    /// Send ahead of queued and planned motion.
    pub fn queue_command(&mut self, cmd: Command) {
        self.admin.push_back(cmd.encode());
        self.link.request_write();
    }

    pub fn queue_raw(&mut self, line: &str) {
        self.admin.push_back(line.to_string());
        self.link.request_write();
    }

    pub(crate) fn queue_released(&mut self, line: String) {
        self.released.push_back(line);
        self.link.request_write();
    }

    pub fn has_i2c(&self) -> bool {
        self.avr.is_some()
    }

    /// Send a control command over I2C so it overtakes the serial stream.
    /// Without a bus, or when the transfer fails, it goes out on the serial
    /// admin queue at once.
    pub fn i2c_command(&mut self, cmd: Command) {
        let Some(avr) = &self.avr else {
            self.queue_command(cmd);
            return;
        };
        let (code, payload) = match &cmd {
            Command::Pause(kind) => (b'P', I2cPayload::Byte(*kind as u8)),
            other => {
                let text = other.encode().into_bytes();
                match text.split_first() {
                    Some((code, [])) => (*code, I2cPayload::None),
                    Some((code, rest)) => (*code, I2cPayload::Block(rest.to_vec())),
                    None => return,
                }
            }
        };
        tracing::debug!("I2C < {}", cmd);
        if let Err(e) = avr.write(code, payload) {
            tracing::warn!("I2C command '{}' failed, sending over serial: {}", cmd, e);
            self.queue_command(cmd);
        }
    }

    /// Bytes to write next, pulling from admin commands, then released
    /// queue entries, then `motion`.
    pub fn pending_output<P: CommandSource>(&mut self, motion: Option<P>) -> Option<&[u8]> {
        let Self {
            link,
            admin,
            released,
            ..
        } = self;
        let mut outbox = Outbox {
            admin,
            released,
            motion,
        };
        link.pending(&mut outbox)
    }

    /// Output is waiting to be written or partly written.
    pub fn is_active(&self) -> bool {
        self.link.is_active() || !self.admin.is_empty() || !self.released.is_empty()
    }

    /// Drop everything in flight.
    pub fn reset(&mut self) {
        self.link.reset();
        self.admin.clear();
        self.released.clear();
    }

    pub fn schedule_reconnect(&mut self, now: Instant) {
        self.reconnect_at = Some(now + self.reconnect_delay);
    }

    pub fn cancel_reconnect(&mut self) {
        self.reconnect_at = None;
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Whether the reconnect retry timer has fired at `now`; clears it if so.
    pub fn reconnect_due(&mut self, now: Instant) -> bool {
        match self.reconnect_at {
            Some(at) if at <= now => {
                self.reconnect_at = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::i2c::tests::MockBus;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Motion(Vec<String>);

    impl CommandSource for Motion {
        fn next_command(&mut self) -> Option<String> {
            self.0.pop()
        }
    }

    fn drain(comm: &mut Comm, motion: &mut Motion) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(bytes) = comm.pending_output(Some(&mut *motion)) {
            let n = bytes.len();
            out.push(String::from_utf8_lossy(&bytes[..n - 1]).into_owned());
            comm.link_mut().advance(n);
        }
        out
    }

    #[test]
    fn test_admin_before_released_before_motion() {
        let mut comm = Comm::new(None, Duration::from_secs(1));
        let mut motion = Motion(vec!["l2".into()]);
        comm.queue_released("#ln=1".into());
        comm.queue_command(Command::Resume);
        assert_eq!(drain(&mut comm, &mut motion), vec!["c", "#ln=1", "l2"]);
        assert!(!comm.link().wants_write());
    }

    #[test]
    fn test_i2c_falls_back_to_serial_after_one_failure() {
        let bus = Rc::new(RefCell::new(MockBus {
            fail: 1,
            ..Default::default()
        }));
        let avr = I2cDevice::new(bus.clone(), 0x2b);
        let mut comm = Comm::new(Some(avr), Duration::from_secs(1));
        comm.i2c_command(Command::Estop);
        let mut motion = Motion(Vec::new());
        assert_eq!(drain(&mut comm, &mut motion), vec!["E"]);
        // The bus was tried once and not retried.
        assert_eq!(bus.borrow().fail, 0);
        assert!(bus.borrow().writes.is_empty());
    }

    #[test]
    fn test_i2c_pause_payload() {
        let bus = Rc::new(RefCell::new(MockBus::default()));
        let avr = I2cDevice::new(bus.clone(), 0x2b);
        let mut comm = Comm::new(Some(avr), Duration::from_secs(1));
        comm.i2c_command(Command::Pause(crate::communication::PauseType::Optional));
        comm.i2c_command(Command::set("fo", 500.0));
        assert_eq!(
            bus.borrow().writes,
            vec![
                (0x2b, b'P', I2cPayload::Byte(2)),
                (0x2b, b'$', I2cPayload::Block(b"fo=500".to_vec())),
            ]
        );
        assert!(!comm.is_active());
    }
}
