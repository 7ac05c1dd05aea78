//! # Machine state store
//!
//! A flat key/value store of machine state shared by the orchestrator, the
//! device link and every peripheral. Writes that change a value accumulate
//! in a pending change batch; the batch is delivered to all listeners at
//! most once per debounce window (see [`StateStore::poll`]).
//!
//! Axis-relative names such as `x_vm` resolve to the per-motor key of the
//! motor assigned to that axis (`2vm` if motor 2 drives X). Names that are
//! not stored may be answered by a registered resolver, which is how the
//! homing parameters are derived from the motor configuration.

pub mod vars;

pub use vars::{AXES, Axis, HomingMode, MOTOR_COUNT, StateValue, VarName, motor_key};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// A batch of changed variables, keyed by resolved name.
pub type Changes = BTreeMap<String, StateValue>;

/// Absolute machine position for every axis that has one.
pub type Position = BTreeMap<Axis, f64>;

pub type ListenerResult = Result<(), Box<dyn std::error::Error>>;

/// Receives change batches. A new listener is first called with the full state.
pub type Listener = Box<dyn FnMut(&Changes) -> ListenerResult>;

/// Computes a variable that is not stored.
pub type Resolver = Box<dyn Fn(&StateStore) -> Option<StateValue>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(250);

pub struct StateStore {
    vars: HashMap<String, StateValue>,
    changes: Changes,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    callbacks: HashMap<String, Resolver>,
    machine_vars: HashSet<String>,
    flush_delay: Duration,
    flush_at: Option<Instant>,
}

impl StateStore {
    pub fn new(flush_delay: Duration) -> Self {
        let mut store = Self {
            vars: HashMap::new(),
            changes: Changes::new(),
            listeners: Vec::new(),
            next_listener: 0,
            callbacks: HashMap::new(),
            machine_vars: HashSet::new(),
            flush_delay,
            flush_at: None,
        };
        store.install_resolvers();
        store.reset();
        store
    }

    fn install_resolvers(&mut self) {
        for motor in 0..MOTOR_COUNT {
            self.set_callback(
                &motor_key(motor, "home_direction"),
                Box::new(move |s| Some(StateValue::Number(s.motor_home_direction(motor)))),
            );
            self.set_callback(
                &motor_key(motor, "home_position"),
                Box::new(move |s| Some(StateValue::Number(s.motor_home_position(motor)))),
            );
            self.set_callback(
                &motor_key(motor, "home_travel"),
                Box::new(move |s| Some(StateValue::Number(s.motor_home_travel(motor)))),
            );
            self.set_callback(
                &motor_key(motor, "latch_backoff"),
                Box::new(move |s| {
                    let lb = s.get_f64(&motor_key(motor, "lb"), 0.0);
                    Some(StateValue::Number(-s.motor_home_direction(motor) * lb))
                }),
            );
            self.set_callback(
                &motor_key(motor, "zero_backoff"),
                Box::new(move |s| {
                    let zb = s.get_f64(&motor_key(motor, "zb"), 0.0);
                    Some(StateValue::Number(-s.motor_home_direction(motor) * zb))
                }),
            );
        }
        self.set_callback("metric", Box::new(|s| Some(StateValue::Bool(s.is_metric()))));
        self.set_callback("imperial", Box::new(|s| Some(StateValue::Bool(!s.is_metric()))));
    }

    /// Unhome every motor and zero all positions and offsets.
    pub fn reset(&mut self) {
        for motor in 0..MOTOR_COUNT {
            self.set(&motor_key(motor, "homed"), false);
        }
        for axis in AXES {
            self.set(&format!("{}p", axis.letter()), 0.0);
            self.set(&format!("offset_{}", axis.letter()), 0.0);
        }
    }

    /// Rewrite an axis-relative name to its per-motor key. Falls through
    /// unchanged when no motor is assigned to the axis.
    pub fn resolve(&self, name: &str) -> String {
        match VarName::parse(name) {
            VarName::Axis { axis, suffix } => match self.find_motor(axis) {
                Some(motor) => motor_key(motor, suffix),
                None => name.to_string(),
            },
            VarName::Raw(raw) => raw.to_string(),
        }
    }

    /// The motor whose axis assignment (`<motor>an`) names `axis`.
    pub fn find_motor(&self, axis: Axis) -> Option<usize> {
        (0..MOTOR_COUNT).find(|&motor| {
            let assigned = match self.vars.get(&motor_key(motor, "an")) {
                Some(StateValue::Number(n)) if *n >= 0.0 => Axis::from_index(*n as usize),
                Some(StateValue::Text(s)) => s.chars().next().and_then(Axis::from_char),
                _ => None,
            };
            assigned == Some(axis)
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.vars.contains_key(&self.resolve(name))
    }

    /// Store `value` under the resolved `name`. Returns `false` (and records
    /// nothing) when the stored value is already equal.
    pub fn set(&mut self, name: &str, value: impl Into<StateValue>) -> bool {
        let key = self.resolve(name);
        let value = value.into();
        if self.vars.get(&key) == Some(&value) {
            return false;
        }
        self.vars.insert(key.clone(), value.clone());
        self.changes.insert(key, value);
        if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.flush_delay);
        }
        true
    }

    pub fn update<I, K>(&mut self, update: I)
    where
        I: IntoIterator<Item = (K, StateValue)>,
        K: AsRef<str>,
    {
        for (name, value) in update {
            self.set(name.as_ref(), value);
        }
    }

    /// Stored value, else a computed one. A missing variable is logged as a
    /// data-integrity problem; use [`StateStore::get_or`] when absence is expected.
    pub fn get(&self, name: &str) -> Option<StateValue> {
        let value = self.lookup(name);
        if value.is_none() {
            tracing::error!("State variable \"{}\" not found", name);
        }
        value
    }

    pub fn get_or(&self, name: &str, default: impl Into<StateValue>) -> StateValue {
        self.lookup(name).unwrap_or_else(|| default.into())
    }

    fn lookup(&self, name: &str) -> Option<StateValue> {
        let key = self.resolve(name);
        if let Some(value) = self.vars.get(&key) {
            return Some(value.clone());
        }
        self.callbacks.get(&key).and_then(|cb| cb(self))
    }

    pub fn get_f64(&self, name: &str, default: f64) -> f64 {
        self.lookup(name).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.lookup(name).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn get_str(&self, name: &str, default: &str) -> String {
        match self.lookup(name) {
            Some(StateValue::Text(s)) => s,
            Some(other) => other.to_string(),
            None => default.to_string(),
        }
    }

    pub fn set_callback(&mut self, name: &str, resolver: Resolver) {
        let key = self.resolve(name);
        self.callbacks.insert(key, resolver);
    }

    /// Register a listener and bootstrap it with the full current state.
    pub fn add_listener(&mut self, mut listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        let snapshot = self.snapshot();
        if let Err(e) = listener(&snapshot) {
            tracing::warn!("State listener {:?} failed during bootstrap: {}", id, e);
        }
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        before != self.listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Pending changes not yet delivered.
    pub fn pending(&self) -> &Changes {
        &self.changes
    }

    /// When the scheduled flush is due, if one is scheduled.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_at
    }

    /// Flush if the debounce window has elapsed at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<Changes> {
        match self.flush_at {
            Some(at) if at <= now => Some(self.flush()),
            _ => None,
        }
    }

    /// Deliver the whole pending batch to every listener, then clear it and
    /// the timer handle. Each listener failure is logged on its own.
    pub fn flush(&mut self) -> Changes {
        self.flush_at = None;
        let batch = std::mem::take(&mut self.changes);
        if batch.is_empty() {
            return batch;
        }
        for (id, listener) in self.listeners.iter_mut() {
            if let Err(e) = listener(&batch) {
                tracing::warn!("State listener {:?} failed: {}", id, e);
            }
        }
        batch
    }

    /// The full current state.
    pub fn snapshot(&self) -> Changes {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Record the variable codes the device announced in its catalog.
    pub fn set_machine_vars<I: IntoIterator<Item = String>>(&mut self, codes: I) {
        self.machine_vars = codes.into_iter().collect();
    }

    pub fn is_machine_var(&self, code: &str) -> bool {
        self.machine_vars.contains(code)
    }

    pub fn machine_var_count(&self) -> usize {
        self.machine_vars.len()
    }

    pub fn is_metric(&self) -> bool {
        !self.get_str("units", "METRIC").eq_ignore_ascii_case("imperial")
    }

    /// Absolute position of every axis with a reported position.
    pub fn get_position(&self) -> Position {
        AXES.iter()
            .filter_map(|axis| {
                self.lookup(&format!("{}p", axis.letter()))
                    .and_then(|v| v.as_f64())
                    .map(|p| (*axis, p))
            })
            .collect()
    }

    pub fn is_axis_homed(&self, axis: Axis) -> bool {
        self.get_bool(&format!("{}_homed", axis.letter()), false)
    }

    pub fn is_axis_enabled(&self, axis: Axis) -> bool {
        match self.find_motor(axis) {
            Some(motor) => self.get_bool(&motor_key(motor, "me"), true),
            None => false,
        }
    }

    pub fn axis_homing_mode(&self, axis: Axis) -> HomingMode {
        match self.find_motor(axis) {
            Some(motor) => self.motor_homing_mode(motor),
            None => HomingMode::Manual,
        }
    }

    pub fn motor_homing_mode(&self, motor: usize) -> HomingMode {
        HomingMode::parse(&self.get_str(&motor_key(motor, "homing_mode"), "manual"))
            .unwrap_or(HomingMode::Manual)
    }

    /// Why `axis` cannot be homed, if it cannot.
    pub fn axis_home_fail_reason(&self, axis: Axis) -> Option<String> {
        let motor = match self.find_motor(axis) {
            Some(motor) => motor,
            None => return Some("Not mapped to motor".to_string()),
        };
        if !self.get_bool(&motor_key(motor, "me"), true) {
            return Some("Motor disabled".to_string());
        }
        let mode = self.motor_homing_mode(motor);
        if mode == HomingMode::Manual {
            return None;
        }
        let min = self.get_f64(&motor_key(motor, "tn"), 0.0);
        let max = self.get_f64(&motor_key(motor, "tm"), 0.0);
        if max <= min {
            return Some("max-soft-limit must be greater than min-soft-limit".to_string());
        }
        None
    }

    pub fn motor_home_direction(&self, motor: usize) -> f64 {
        self.motor_homing_mode(motor).direction()
    }

    pub fn motor_home_position(&self, motor: usize) -> f64 {
        match self.motor_homing_mode(motor) {
            HomingMode::SwitchMin | HomingMode::StallMin => {
                self.get_f64(&motor_key(motor, "tn"), 0.0)
            }
            HomingMode::SwitchMax | HomingMode::StallMax => {
                self.get_f64(&motor_key(motor, "tm"), 0.0)
            }
            HomingMode::Manual => 0.0,
        }
    }

    /// Distance to search for the home switch: one and a half times the
    /// soft-limit span, toward the switch.
    pub fn motor_home_travel(&self, motor: usize) -> f64 {
        let min = self.get_f64(&motor_key(motor, "tn"), 0.0);
        let max = self.get_f64(&motor_key(motor, "tm"), 0.0);
        self.motor_home_direction(motor) * (max - min) * 1.5
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_DELAY)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("vars", &self.vars.len())
            .field("pending", &self.changes.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording_listener(log: Rc<RefCell<Vec<Changes>>>) -> Listener {
        Box::new(move |changes| {
            log.borrow_mut().push(changes.clone());
            Ok(())
        })
    }

    #[test]
    fn test_resolve_through_motor_assignment() {
        let mut state = StateStore::default();
        state.set("2an", 0.0); // motor 2 drives X
        assert_eq!(state.resolve("x_vm"), "2vm");
        assert_eq!(state.resolve("y_vm"), "y_vm");
        assert_eq!(state.resolve("xp"), "xp");

        state.set("x_vm", 5000.0);
        assert_eq!(state.get_f64("2vm", 0.0), 5000.0);
    }

    #[test]
    fn test_set_unchanged_is_noop() {
        let mut state = StateStore::default();
        state.flush();
        assert!(state.set("xp", 1.0));
        assert!(!state.set("xp", 1.0));
        assert_eq!(state.pending().len(), 1);
    }

    #[test]
    fn test_flush_delivers_batch_once() {
        let mut state = StateStore::default();
        state.flush();
        let log = Rc::new(RefCell::new(Vec::new()));
        state.add_listener(recording_listener(log.clone()));
        log.borrow_mut().clear();

        state.set("xp", 1.0);
        state.set("yp", 2.0);
        let deadline = state.flush_deadline().unwrap();
        assert!(state.poll(deadline - Duration::from_millis(1)).is_none());
        let batch = state.poll(deadline).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(log.borrow().len(), 1);
        assert!(state.flush_deadline().is_none());
        assert!(state.pending().is_empty());
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let mut state = StateStore::default();
        state.flush();
        let log = Rc::new(RefCell::new(Vec::new()));
        state.add_listener(Box::new(|_| Err("broken".into())));
        state.add_listener(recording_listener(log.clone()));
        log.borrow_mut().clear();

        state.set("cycle", "mdi");
        state.flush();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_remove_listener() {
        let mut state = StateStore::default();
        let log = Rc::new(RefCell::new(Vec::new()));
        let id = state.add_listener(recording_listener(log.clone()));
        assert!(state.remove_listener(id));
        assert!(!state.remove_listener(id));
        log.borrow_mut().clear();
        state.set("xp", 3.0);
        state.flush();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_computed_homing_variables() {
        let mut state = StateStore::default();
        state.set("1an", 1.0); // motor 1 drives Y
        state.set("1homing_mode", "switch-max");
        state.set("1tn", 0.0);
        state.set("1tm", 300.0);
        assert_eq!(state.get_f64("y_home_direction", 0.0), 1.0);
        assert_eq!(state.get_f64("y_home_position", -1.0), 300.0);
        assert_eq!(state.get_f64("1home_travel", 0.0), 450.0);
        assert_eq!(state.axis_homing_mode(Axis::Y), HomingMode::SwitchMax);
        assert!(state.axis_home_fail_reason(Axis::Y).is_none());
        assert!(state.axis_home_fail_reason(Axis::Z).is_some());
    }

    #[test]
    fn test_get_missing_returns_default() {
        let state = StateStore::default();
        assert_eq!(state.get("nope"), None);
        assert_eq!(state.get_or("nope", 7.0), StateValue::Number(7.0));
        assert!(state.get_bool("metric", false));
    }

    #[test]
    fn test_position_snapshot() {
        let mut state = StateStore::default();
        state.set("xp", 10.0);
        state.set("zp", -2.5);
        let pos = state.get_position();
        assert_eq!(pos[&Axis::X], 10.0);
        assert_eq!(pos[&Axis::Z], -2.5);
        assert_eq!(pos[&Axis::C], 0.0);
    }
}
