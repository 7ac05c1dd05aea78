// src/machine/mod.rs - Machine orchestrator: cycles, telemetry reactions and user operations
//!
//! [`Mach`] is the single owner of the state store, the command queue, the
//! link and the planner. It never blocks and never sleeps: the driver feeds
//! it received bytes, asks it what to write, and calls [`Mach::poll`] when
//! [`Mach::next_deadline`] passes.

pub mod comm;
pub mod cycle;

pub use comm::{Comm, QueuedAction};
pub use cycle::{Cycle, PauseReason, RunState};

use crate::communication::{Command, CommandQueue, LinkError, PauseType, Telemetry};
use crate::config::Config;
use crate::hardware::I2cDevice;
use crate::planner::adapter::PlannerSource;
use crate::planner::{PathPlanner, PlannerAdapter, PlannerError, Program};
use crate::state::{AXES, Axis, Changes, HomingMode, StateStore, StateValue, motor_key};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("cannot start {requested} cycle while {current} cycle is active")]
    CycleConflict { current: Cycle, requested: Cycle },
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error("{0} is not supported")]
    Unsupported(&'static str),
    #[error("cannot home {axis} axis: {reason}")]
    Home { axis: Axis, reason: String },
    #[error("position required to home {0} axis manually")]
    PositionRequired(Axis),
    #[error("{0} axis is not enabled")]
    AxisDisabled(Axis),
    #[error("cannot set position during {0} cycle")]
    Busy(Cycle),
    #[error("no program loaded")]
    NoProgram,
}

/// Motor driver fault bits in `<motor>df`.
const MOTOR_FAULT_MASK: u32 = 0x1f;

/// Order axes are homed in when homing everything.
const HOME_ORDER: [Axis; 6] = [Axis::Z, Axis::X, Axis::Y, Axis::A, Axis::B, Axis::C];

/// A user request.
#[derive(Debug, Clone, PartialEq)]
pub enum MachOp {
    Mdi(String),
    Jog(BTreeMap<Axis, f64>),
    Home { axis: Option<Axis>, position: Option<f64> },
    Unhome(Axis),
    Start(Option<Program>),
    Stop,
    Pause,
    OptionalPause,
    Unpause,
    Step,
    Estop,
    Clear,
    SetPosition { axis: Axis, position: f64 },
    OverrideFeed(f64),
    OverrideSpeed(f64),
    Reboot,
}

pub struct Mach {
    state: StateStore,
    cmdq: CommandQueue<QueuedAction>,
    comm: Comm,
    planner: PlannerAdapter,
    config: Config,
    program: Option<Program>,
    run_state: Option<RunState>,
    unpausing: bool,
    stopping: bool,
    cycle_check_at: Option<Instant>,
    cycle_check_delay: Duration,
    /// Motors with a driver fault, one bit each.
    motor_faults: u16,
}

impl Mach {
    pub fn new(config: Config, planner: Box<dyn PathPlanner>, avr: Option<I2cDevice>) -> Self {
        let mut mach = Self {
            state: StateStore::new(config.timing.state_flush()),
            cmdq: CommandQueue::new(),
            comm: Comm::new(avr, config.timing.reconnect()),
            planner: PlannerAdapter::new(planner),
            cycle_check_delay: config.timing.cycle_check(),
            config,
            program: None,
            run_state: None,
            unpausing: false,
            stopping: false,
            cycle_check_at: None,
            motor_faults: 0,
        };
        mach.configure_state();
        mach.state.set("cycle", Cycle::Idle.as_str());
        mach
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StateStore {
        &mut self.state
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    pub fn comm_mut(&mut self) -> &mut Comm {
        &mut self.comm
    }

    pub fn cmdq(&self) -> &CommandQueue<QueuedAction> {
        &self.cmdq
    }

    pub fn planner(&self) -> &PlannerAdapter {
        &self.planner
    }

    pub fn cycle(&self) -> Cycle {
        Cycle::parse(&self.state.get_str("cycle", "idle")).unwrap_or(Cycle::Idle)
    }

    pub fn run_state(&self) -> Option<RunState> {
        RunState::parse(&self.state.get_str("xx", ""))
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        let pr = self.state.get_str("pr", "");
        (!pr.is_empty()).then(|| PauseReason::parse(&pr))
    }

    pub fn is_unpausing(&self) -> bool {
        self.unpausing
    }

    /// Motors whose driver currently reports a fault.
    pub fn faulted_motors(&self) -> Vec<usize> {
        (0..10).filter(|m| self.motor_faults & (1 << m) != 0).collect()
    }

    /// Publish the configured motor and device settings locally.
    fn configure_state(&mut self) {
        for (motor, mc) in self.config.motors.iter().enumerate() {
            for (code, value) in mc.settings() {
                self.state.set(&motor_key(motor, code), value);
            }
        }
        for (name, value) in &self.config.settings {
            self.state.set(name, value.clone());
        }
    }

    /// Send every configured setting the device says it understands.
    fn configure_device(&mut self) {
        let mut sent = 0;
        for (motor, mc) in self.config.motors.iter().enumerate() {
            for (code, value) in mc.settings() {
                if self.state.is_machine_var(code) {
                    self.comm
                        .queue_command(Command::set(&motor_key(motor, code), value));
                    sent += 1;
                }
            }
        }
        for (name, value) in &self.config.settings {
            if self.state.is_machine_var(name) {
                self.comm.queue_command(Command::set(name, value.clone()));
                sent += 1;
            }
        }
        tracing::debug!("Configured {} device variables", sent);
    }

    // ---- Link driving ----------------------------------------------------

    /// Start talking to a device that may have been running for a while.
    pub fn connect(&mut self) {
        self.reconnect();
    }

    /// Bytes received from the device.
    pub fn receive(&mut self, data: &[u8]) {
        let lines = self.comm.link_mut().feed(data);
        for line in lines {
            self.handle_line(&line);
        }
    }

    pub fn wants_write(&self) -> bool {
        self.comm.link().wants_write()
    }

    /// Bytes to write next, if any.
    pub fn pending_output(&mut self) -> Option<&[u8]> {
        self.apply_released();
        let motion = self.planner.is_running() && !self.stopping;
        let Self {
            comm,
            planner,
            cmdq,
            ..
        } = self;
        if motion {
            comm.pending_output(Some(PlannerSource { planner, cmdq }))
        } else {
            comm.pending_output::<PlannerSource>(None)
        }
    }

    /// `n` bytes of the pending output were written.
    pub fn advance_output(&mut self, n: usize) {
        self.comm.link_mut().advance(n);
        // Planning can release queued actions immediately.
        self.apply_released();
    }

    /// A read or write on the port failed or the port closed.
    pub fn io_error(&mut self, err: &LinkError) {
        tracing::error!("Controller link error: {}", err);
        self.reconnect();
    }

    pub fn set_link_attached(&mut self, attached: bool) {
        self.comm.link_mut().set_attached(attached);
    }

    /// One line of device telemetry.
    pub fn handle_line(&mut self, line: &str) {
        let telemetry = match Telemetry::decode(line) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Discarding telemetry '{}': {}", line, e);
                return;
            }
        };
        match telemetry {
            Telemetry::Variables(codes) => self.resync(codes),
            Telemetry::Log(log) => {
                log.emit();
                if log.level == crate::communication::LogLevel::Error {
                    self.comm_error();
                }
            }
            Telemetry::Firmware(info) => {
                tracing::info!("Controller firmware started: {}", info);
                self.reconnect();
            }
            Telemetry::Update(update) => {
                let has_run_state = update.iter().any(|(k, _)| k == "xx");
                let active = update
                    .iter()
                    .find(|(k, _)| k == "id")
                    .and_then(|(_, v)| v.as_f64());
                self.state.update(update);
                if let Some(id) = active {
                    self.planner.set_active(id.max(0.0) as u32, &mut self.cmdq);
                }
                if has_run_state {
                    self.comm.link_mut().request_write();
                }
                self.apply_released();
            }
        }
    }

    fn comm_error(&mut self) {
        if self.planner.is_busy(&self.cmdq) {
            tracing::warn!("Controller error, discarding plan");
            self.planner.reset(&mut self.cmdq);
        }
    }

    /// The device (re)announced its variable catalog.
    fn resync(&mut self, codes: Vec<String>) {
        tracing::info!("Controller announced {} variables", codes.len());
        self.comm.cancel_reconnect();
        self.state.set_machine_vars(codes);
        self.configure_device();
        self.comm.queue_command(Command::Dump);
        for axis in AXES {
            let position = self.state.get_f64(&format!("{}p", axis.letter()), 0.0);
            self.comm.queue_command(Command::SetAxis {
                axis,
                position: position as f32,
            });
        }
    }

    /// Throw away everything in flight and ask the device to introduce itself.
    fn reconnect(&mut self) {
        tracing::info!("Resynchronizing with controller");
        self.planner.reset(&mut self.cmdq);
        self.comm.reset();
        self.unpausing = false;
        self.stopping = false;
        self.cmdq.flush(QueuedAction::Resync);
        self.apply_released();
    }

    fn apply_released(&mut self) {
        while self.cmdq.has_released() {
            for action in self.cmdq.take_released() {
                self.apply(action);
            }
        }
    }

    fn apply(&mut self, action: QueuedAction) {
        match action {
            QueuedAction::SetState { name, value } => {
                self.state.set(&name, value);
            }
            QueuedAction::Message(msg) => {
                tracing::info!(target: "program", "{}", msg);
                self.state.set("message", msg);
            }
            QueuedAction::Send(line) => self.comm.queue_released(line),
            QueuedAction::Resync => {
                self.comm.queue_command(Command::Resume);
                self.comm.queue_command(Command::Help);
                if self.comm.link().is_attached() {
                    self.comm.schedule_reconnect(Instant::now());
                }
            }
        }
    }

    // ---- Timers ----------------------------------------------------------

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.state.flush_deadline(),
            self.cycle_check_at,
            self.comm.reconnect_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Run whatever timers are due. Returns the flushed change batch, if any.
    pub fn poll(&mut self, now: Instant) -> Option<Changes> {
        let batch = self.state.poll(now);
        if let Some(batch) = &batch {
            self.on_state_update(batch, now);
        }
        if self.cycle_check_at.is_some_and(|at| at <= now) {
            self.cycle_check_at = None;
            self.update_cycle(now);
        }
        if self.comm.reconnect_due(now) {
            tracing::warn!("Controller did not answer, retrying");
            self.reconnect();
        }
        self.apply_released();
        batch
    }

    /// React to a delivered change batch.
    fn on_state_update(&mut self, batch: &Changes, now: Instant) {
        for (key, value) in batch {
            let Some(motor) = key
                .strip_suffix("df")
                .filter(|m| m.len() == 1)
                .and_then(|m| m.parse::<u32>().ok())
            else {
                continue;
            };
            let flags = value.as_f64().unwrap_or(0.0) as u32;
            let bit = 1u16 << motor;
            if flags & MOTOR_FAULT_MASK != 0 {
                if self.motor_faults & bit == 0 {
                    tracing::error!("Motor {} driver fault: 0x{:02x}", motor, flags);
                }
                self.motor_faults |= bit;
            } else if self.motor_faults & bit != 0 {
                tracing::info!("Motor {} driver fault cleared", motor);
                self.motor_faults &= !bit;
            }
        }

        let state = self.run_state();
        let changed = state != self.run_state;
        self.run_state = state;

        if changed {
            if let Some(state) = state {
                tracing::info!("Controller state {}", state);
            }
            if state == Some(RunState::Estopped) {
                self.planner.reset(&mut self.cmdq);
                self.stopping = false;
                if self.cycle() != Cycle::Idle {
                    self.set_cycle(Cycle::Idle);
                }
            }
            if state != Some(RunState::Holding) {
                self.unpausing = false;
            }
            if state == Some(RunState::Ready) && self.stopping {
                self.planner.reset(&mut self.cmdq);
                self.stopping = false;
            }
            if state == Some(RunState::Holding) {
                // The device discards its queue on hold; replan from where it stopped.
                self.comm.i2c_command(Command::Flush);
                self.comm.queue_command(Command::Resume);
                self.planner.position_change(&self.state);
            }
        }

        if state == Some(RunState::Holding) && (changed || batch.contains_key("pr")) {
            self.maybe_auto_unpause();
        }

        self.cycle_check_at = None;
        if self.cycle() != Cycle::Idle && state == Some(RunState::Ready) {
            self.cycle_check_at = Some(now + self.cycle_check_delay);
        }
    }

    fn maybe_auto_unpause(&mut self) {
        let Some(reason) = self.pause_reason() else {
            return;
        };
        let auto = match reason {
            PauseReason::SwitchFound => self.planner.is_synchronizing(),
            PauseReason::UserStop => true,
            PauseReason::OptionalPause => !self.state.get_bool("optional_pause", false),
            _ => false,
        };
        if auto {
            tracing::info!("Continuing after '{}'", reason);
            if reason == PauseReason::SwitchFound {
                self.planner.synchronize(0.0);
            }
            self.unpause();
        }
    }

    /// Drop to idle once nothing remains to execute, else check again later.
    fn update_cycle(&mut self, now: Instant) {
        if self.cycle() == Cycle::Idle || self.run_state() != Some(RunState::Ready) {
            return;
        }
        if self.planner.is_busy(&self.cmdq) || self.comm.is_active() {
            self.cycle_check_at = Some(now + self.cycle_check_delay);
            return;
        }
        self.set_cycle(Cycle::Idle);
    }

    fn set_cycle(&mut self, cycle: Cycle) {
        tracing::info!("Cycle {} -> {}", self.cycle(), cycle);
        self.state.set("cycle", cycle.as_str());
    }

    fn check_cycle(&self, requested: Cycle) -> Result<(), MachineError> {
        let current = self.cycle();
        if current != Cycle::Idle && current != requested {
            return Err(MachineError::CycleConflict { current, requested });
        }
        Ok(())
    }

    /// Enter `cycle`, taking the current position as the planner's start.
    fn begin_cycle(&mut self, cycle: Cycle) -> Result<(), MachineError> {
        self.check_cycle(cycle)?;
        if self.cycle() != cycle {
            self.planner.position_change(&self.state);
            self.set_cycle(cycle);
        }
        Ok(())
    }

    fn load_and_begin(
        &mut self,
        cycle: Cycle,
        program: &Program,
        with_limits: bool,
    ) -> Result<(), MachineError> {
        self.check_cycle(cycle)?;
        self.planner.load(program, &self.state, with_limits)?;
        self.begin_cycle(cycle)?;
        self.comm.link_mut().request_write();
        Ok(())
    }

    /// Queue a device command behind everything already queued.
    fn queue_synced(&mut self, cmd: Command) {
        let id = self.cmdq.last_enqueue_id();
        self.cmdq.enqueue(id, false, QueuedAction::Send(cmd.encode()));
        self.apply_released();
    }

    fn is_paused(&self) -> bool {
        self.run_state() == Some(RunState::Holding)
    }

    // ---- User operations -------------------------------------------------

    pub fn execute(&mut self, op: MachOp) -> Result<(), MachineError> {
        match op {
            MachOp::Mdi(cmd) => self.mdi(&cmd, true),
            MachOp::Jog(axes) => self.jog(&axes),
            MachOp::Home { axis, position } => self.home(axis, position),
            MachOp::Unhome(axis) => {
                self.unhome(axis);
                Ok(())
            }
            MachOp::Start(program) => {
                if let Some(program) = program {
                    self.program = Some(program);
                }
                self.start()
            }
            MachOp::Stop => {
                self.stop();
                Ok(())
            }
            MachOp::Pause => {
                self.pause();
                Ok(())
            }
            MachOp::OptionalPause => {
                self.optional_pause();
                Ok(())
            }
            MachOp::Unpause => {
                self.unpause();
                Ok(())
            }
            MachOp::Step => self.step(),
            MachOp::Estop => {
                self.estop();
                Ok(())
            }
            MachOp::Clear => {
                self.clear();
                Ok(())
            }
            MachOp::SetPosition { axis, position } => self.set_position(axis, position),
            MachOp::OverrideFeed(x) => {
                self.override_feed(x);
                Ok(())
            }
            MachOp::OverrideSpeed(x) => {
                self.override_speed(x);
                Ok(())
            }
            MachOp::Reboot => {
                self.reboot();
                Ok(())
            }
        }
    }

    /// Run one block of G-code. Lines starting with `$` go to the device as
    /// they are, as does anything after a leading `\`.
    pub fn mdi(&mut self, cmd: &str, with_limits: bool) -> Result<(), MachineError> {
        let cmd = cmd.trim();
        if cmd.is_empty() {
            return Ok(());
        }
        if cmd.starts_with('$') {
            self.comm.queue_raw(cmd);
            return Ok(());
        }
        if let Some(raw) = cmd.strip_prefix('\\') {
            self.comm.queue_raw(raw);
            return Ok(());
        }
        self.load_and_begin(Cycle::Mdi, &Program::Text(cmd.to_string()), with_limits)
    }

    pub fn jog(&mut self, axes: &BTreeMap<Axis, f64>) -> Result<(), MachineError> {
        self.begin_cycle(Cycle::Jogging)?;
        let axes = axes.iter().map(|(a, v)| (*a, *v as f32)).collect();
        self.comm.queue_command(Command::Jog(axes));
        Ok(())
    }

    /// Home one axis, or every axis that can be homed.
    pub fn home(&mut self, axis: Option<Axis>, position: Option<f64>) -> Result<(), MachineError> {
        let axes: Vec<Axis> = match axis {
            Some(axis) => vec![axis],
            None => HOME_ORDER.to_vec(),
        };
        let all = axes.len() > 1;
        let mut programs = String::new();

        for axis in axes {
            let mode = self.state.axis_homing_mode(axis);
            if all && (!self.state.is_axis_enabled(axis) || mode == HomingMode::Manual) {
                continue;
            }
            if let Some(reason) = self.state.axis_home_fail_reason(axis) {
                let err = MachineError::Home { axis, reason };
                if all {
                    tracing::error!("{}", err);
                    continue;
                }
                return Err(err);
            }
            if mode == HomingMode::Manual {
                let position = position.ok_or(MachineError::PositionRequired(axis))?;
                self.home_manually(axis, position);
                continue;
            }
            tracing::info!("Homing {} axis", axis);
            programs.push_str(&self.homing_procedure(axis));
        }

        if programs.is_empty() {
            return Ok(());
        }
        self.load_and_begin(Cycle::Homing, &Program::Text(programs), false)
    }

    fn home_manually(&mut self, axis: Axis, position: f64) {
        tracing::info!("Homing {} axis manually at {}", axis, position);
        self.comm.queue_command(Command::SetAxis {
            axis,
            position: position as f32,
        });
        self.state.set(&format!("{}p", axis.letter()), position);
        self.state.set(&format!("{}_homed", axis.letter()), true);
        self.planner.position_change(&self.state);
    }

    /// G-code that seeks the switch, backs off, latches slowly and then
    /// moves to and sets the home position.
    pub fn homing_procedure(&self, axis: Axis) -> String {
        let a = axis.letter();
        let v = |name: &str| self.state.get_f64(&format!("{}_{}", a, name), 0.0);
        let upper = axis.to_string();
        let search = v("sv") * 1000.0;
        let latch = v("lv") * 1000.0;
        let travel = v("home_travel");
        let latch_backoff = v("latch_backoff");
        let zero_backoff = v("zero_backoff");
        let home = v("home_position");
        format!(
            "G28.2 {u}0 F{search:.3}\n\
             G38.6 {u}{travel:.3}\n\
             G38.8 {u}{latch_backoff:.3} F{latch:.3}\n\
             G38.6 {u}{back:.3}\n\
             G91 G0 G53 {u}{zero_backoff:.3}\n\
             G90 G28.3 {u}{home:.3}\n",
            u = upper,
            back = latch_backoff * -1.5,
        )
    }

    pub fn unhome(&mut self, axis: Axis) {
        self.state.set(&format!("{}_homed", axis.letter()), false);
    }

    pub fn start(&mut self) -> Result<(), MachineError> {
        let program = self.program.clone().ok_or(MachineError::NoProgram)?;
        self.load_and_begin(Cycle::Running, &program, true)
    }

    pub fn stop(&mut self) {
        tracing::info!("Stop");
        self.comm.i2c_command(Command::Stop);
        self.stopping = true;
        if self.run_state() == Some(RunState::Ready) || self.run_state().is_none() {
            self.planner.reset(&mut self.cmdq);
            self.stopping = false;
        }
    }

    pub fn pause(&mut self) {
        self.comm.i2c_command(Command::Pause(PauseType::User));
    }

    pub fn optional_pause(&mut self) {
        self.comm.i2c_command(Command::Pause(PauseType::Optional));
    }

    pub fn unpause(&mut self) {
        if !self.is_paused() || self.unpausing {
            return;
        }
        tracing::info!(
            "Unpause: {}",
            self.pause_reason().map(|r| r.to_string()).unwrap_or_default()
        );
        self.comm.i2c_command(Command::Flush);
        self.planner.restart(&self.state, &mut self.cmdq);
        self.comm.queue_command(Command::Resume);
        self.comm.i2c_command(Command::Unpause);
        self.unpausing = true;
    }

    pub fn step(&mut self) -> Result<(), MachineError> {
        Err(MachineError::Unsupported("single stepping"))
    }

    pub fn estop(&mut self) {
        if self.run_state() != Some(RunState::Estopped) {
            tracing::warn!("Emergency stop");
            self.comm.i2c_command(Command::Estop);
        }
    }

    pub fn clear(&mut self) {
        if self.run_state() == Some(RunState::Estopped) {
            self.planner.reset(&mut self.cmdq);
            self.comm.i2c_command(Command::Clear);
        }
    }

    /// Change the reported position of `axis`. A homed axis keeps its
    /// absolute position and gets a new offset instead.
    pub fn set_position(&mut self, axis: Axis, position: f64) -> Result<(), MachineError> {
        let a = axis.letter();
        if self.state.is_axis_homed(axis) {
            let absolute = self.state.get_f64(&format!("{}p", a), 0.0);
            let id = self.cmdq.last_enqueue_id();
            self.cmdq.enqueue(
                id,
                false,
                QueuedAction::SetState {
                    name: format!("offset_{}", a),
                    value: StateValue::from(absolute - position),
                },
            );
            self.apply_released();
            return Ok(());
        }
        if !self.state.is_axis_enabled(axis) {
            return Err(MachineError::AxisDisabled(axis));
        }
        let cycle = self.cycle();
        if cycle != Cycle::Idle && !self.is_paused() {
            return Err(MachineError::Busy(cycle));
        }
        let target = position + self.state.get_f64(&format!("offset_{}", a), 0.0);
        self.queue_synced(Command::SetAxis {
            axis,
            position: target as f32,
        });
        Ok(())
    }

    pub fn override_feed(&mut self, value: f64) {
        self.comm
            .queue_command(Command::set("fo", (value * 1000.0) as i32));
    }

    pub fn override_speed(&mut self, value: f64) {
        self.comm
            .queue_command(Command::set("so", (value * 1000.0) as i32));
    }

    pub fn reboot(&mut self) {
        tracing::info!("Rebooting controller");
        self.planner.reset(&mut self.cmdq);
        self.comm.queue_command(Command::Reboot);
    }
}

impl std::fmt::Debug for Mach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mach")
            .field("cycle", &self.cycle())
            .field("run_state", &self.run_state)
            .field("queued", &self.cmdq.len())
            .field("unpausing", &self.unpausing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ScriptedPlanner;

    fn mach() -> Mach {
        Mach::new(Config::default(), Box::new(ScriptedPlanner::new()), None)
    }

    fn drain(mach: &mut Mach) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(bytes) = mach.pending_output() {
            let n = bytes.len();
            out.push(String::from_utf8_lossy(&bytes[..n - 1]).into_owned());
            mach.advance_output(n);
        }
        out
    }

    fn later(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[test]
    fn test_connect_announces_and_waits_for_catalog() {
        let mut mach = mach();
        mach.connect();
        assert_eq!(drain(&mut mach), vec!["c", "h"]);
        assert!(mach.comm().reconnect_deadline().is_some());

        mach.handle_line(r#"{"variables":["vm","me","xp"]}"#);
        assert!(mach.comm().reconnect_deadline().is_none());
        let out = drain(&mut mach);
        assert_eq!(out[0], "$0me=1");
        assert_eq!(out[1], "$0vm=5");
        assert_eq!(out[6], "$3me=0");
        assert_eq!(out[8], "D");
        assert!(out[9].starts_with("ax"));
        assert_eq!(out.len(), 9 + AXES.len());
    }

    #[test]
    fn test_unanswered_resync_is_retried() {
        let mut mach = mach();
        mach.connect();
        drain(&mut mach);
        mach.poll(later(5));
        assert_eq!(drain(&mut mach), vec!["c", "h"]);
    }

    #[test]
    fn test_estop_resets_running_program() {
        let mut mach = mach();
        mach.execute(MachOp::Start(Some(Program::Text(
            r#"{"id":1,"type":"dwell","seconds":5}
{"id":2,"type":"dwell","seconds":5}"#
                .into(),
        ))))
        .unwrap();
        assert_eq!(mach.cycle(), Cycle::Running);
        let out = drain(&mut mach);
        assert_eq!(out.len(), 2);
        assert!(mach.planner().is_running());

        mach.handle_line(r#"{"xx":"ESTOPPED"}"#);
        mach.poll(later(1));
        assert!(!mach.planner().is_running());
        assert_eq!(mach.cycle(), Cycle::Idle);
    }

    #[test]
    fn test_switch_found_continues_seek() {
        let mut mach = mach();
        mach.execute(MachOp::Start(Some(Program::Text(
            r#"{"id":1,"type":"seek","switch":"probe","active":true,"error":true}"#.into(),
        ))))
        .unwrap();
        assert_eq!(drain(&mut mach), vec!["#id=1\ns13"]);
        assert!(mach.planner().is_synchronizing());

        mach.handle_line(r#"{"id":1,"xx":"HOLDING"}"#);
        mach.handle_line(r#"{"pr":"Switch found"}"#);
        mach.poll(later(1));

        assert!(mach.is_unpausing());
        assert!(!mach.planner().is_synchronizing());
        let out = drain(&mut mach);
        assert_eq!(out.last().map(String::as_str), Some("U"));
        assert!(out.contains(&"F".to_string()));
    }

    #[test]
    fn test_user_pause_waits_for_unpause() {
        let mut mach = mach();
        mach.handle_line(r#"{"xx":"HOLDING","pr":"User pause"}"#);
        mach.poll(later(1));
        assert!(!mach.is_unpausing());
        drain(&mut mach);

        mach.execute(MachOp::Unpause).unwrap();
        assert!(mach.is_unpausing());
        assert_eq!(drain(&mut mach), vec!["F", "c", "U"]);

        mach.execute(MachOp::Unpause).unwrap();
        assert!(drain(&mut mach).is_empty());
    }

    #[test]
    fn test_malformed_telemetry_is_discarded() {
        let mut mach = mach();
        mach.handle_line("{\"xp\": 1.0");
        mach.handle_line("[1, 2]");
        mach.handle_line(r#"{"xp":2.5}"#);
        assert_eq!(mach.state().get_f64("xp", 0.0), 2.5);
    }

    #[test]
    fn test_conflicting_cycle_is_rejected() {
        let mut mach = mach();
        let mut axes = BTreeMap::new();
        axes.insert(Axis::X, 0.5);
        mach.jog(&axes).unwrap();
        assert_eq!(mach.cycle(), Cycle::Jogging);
        mach.jog(&axes).unwrap();

        let err = mach.mdi("G0 X10", true).unwrap_err();
        assert!(matches!(
            err,
            MachineError::CycleConflict {
                current: Cycle::Jogging,
                requested: Cycle::Mdi
            }
        ));
    }

    #[test]
    fn test_cycle_returns_to_idle_when_drained() {
        let mut mach = mach();
        let mut axes = BTreeMap::new();
        axes.insert(Axis::Y, -1.0);
        mach.jog(&axes).unwrap();
        mach.handle_line(r#"{"xx":"READY"}"#);
        let t1 = later(1);
        mach.poll(t1);
        assert_eq!(mach.cycle(), Cycle::Jogging);
        assert!(mach.next_deadline().is_some());

        drain(&mut mach);
        mach.poll(t1 + Duration::from_secs(1));
        assert_eq!(mach.cycle(), Cycle::Idle);
    }

    #[test]
    fn test_raw_mdi_bypasses_planner() {
        let mut mach = mach();
        mach.mdi("$xx=1", true).unwrap();
        mach.mdi("\\E", true).unwrap();
        mach.mdi("   ", true).unwrap();
        assert_eq!(drain(&mut mach), vec!["$xx=1", "E"]);
        assert_eq!(mach.cycle(), Cycle::Idle);
    }

    #[test]
    fn test_manual_homing() {
        let mut mach = mach();
        let err = mach.home(Some(Axis::X), None).unwrap_err();
        assert!(matches!(err, MachineError::PositionRequired(Axis::X)));

        mach.home(Some(Axis::X), Some(5.0)).unwrap();
        assert!(mach.state().is_axis_homed(Axis::X));
        assert_eq!(mach.state().get_f64("xp", 0.0), 5.0);

        mach.unhome(Axis::X);
        assert!(!mach.state().is_axis_homed(Axis::X));
    }

    #[test]
    fn test_switch_homing_procedure() {
        let mut mach = mach();
        mach.state_mut().set("0homing_mode", "switch-min");
        mach.state_mut().set("0tn", 0.0);
        mach.state_mut().set("0tm", 100.0);

        let program = mach.homing_procedure(Axis::X);
        assert!(program.starts_with(
            "G28.2 X0 F500.000\nG38.6 X-150.000\nG38.8 X5.000 F100.000\nG38.6 X-7.500\n"
        ));
        assert!(program.ends_with("G90 G28.3 X0.000\n"));

        // G-code needs a real planner.
        let err = mach.home(Some(Axis::X), None).unwrap_err();
        assert!(matches!(err, MachineError::Planner(PlannerError::Unsupported(_))));
        assert_eq!(mach.cycle(), Cycle::Idle);
    }

    #[test]
    fn test_home_rejects_bad_limits() {
        let mut mach = mach();
        mach.state_mut().set("1homing_mode", "stall-max");
        let err = mach.home(Some(Axis::Y), None).unwrap_err();
        assert!(matches!(err, MachineError::Home { axis: Axis::Y, .. }));
    }

    #[test]
    fn test_set_position() {
        let mut mach = mach();
        mach.set_position(Axis::X, 10.0).unwrap();
        let out = drain(&mut mach);
        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with("ax"));

        mach.state_mut().set("x_homed", true);
        mach.state_mut().set("xp", 50.0);
        mach.set_position(Axis::X, 10.0).unwrap();
        assert_eq!(mach.state().get_f64("offset_x", 0.0), 40.0);
        assert!(drain(&mut mach).is_empty());

        assert!(matches!(
            mach.set_position(Axis::A, 1.0),
            Err(MachineError::AxisDisabled(Axis::A))
        ));

        let mut axes = BTreeMap::new();
        axes.insert(Axis::Y, 1.0);
        mach.jog(&axes).unwrap();
        assert!(matches!(
            mach.set_position(Axis::Y, 1.0),
            Err(MachineError::Busy(Cycle::Jogging))
        ));
    }

    #[test]
    fn test_simple_commands() {
        let mut mach = mach();
        mach.execute(MachOp::OverrideFeed(0.5)).unwrap();
        mach.execute(MachOp::OverrideSpeed(1.25)).unwrap();
        mach.execute(MachOp::Pause).unwrap();
        mach.execute(MachOp::OptionalPause).unwrap();
        mach.execute(MachOp::Estop).unwrap();
        mach.execute(MachOp::Clear).unwrap();
        mach.execute(MachOp::Reboot).unwrap();
        assert_eq!(
            drain(&mut mach),
            vec!["$fo=500", "$so=1250", "P0", "P2", "E", "R"]
        );
        assert!(matches!(mach.step(), Err(MachineError::Unsupported(_))));
        assert!(matches!(mach.start(), Err(MachineError::NoProgram)));
    }

    #[test]
    fn test_clear_after_estop() {
        let mut mach = mach();
        mach.handle_line(r#"{"xx":"ESTOPPED"}"#);
        mach.execute(MachOp::Estop).unwrap();
        mach.execute(MachOp::Clear).unwrap();
        assert_eq!(drain(&mut mach), vec!["C"]);
    }

    #[test]
    fn test_queued_state_waits_for_active_id() {
        let mut mach = mach();
        mach.execute(MachOp::Start(Some(Program::Text(
            r#"{"id":1,"type":"set","name":"line","value":12}
{"id":1,"type":"dwell","seconds":1}
{"id":2,"type":"dwell","seconds":1}"#
                .into(),
        ))))
        .unwrap();
        drain(&mut mach);
        assert!(!mach.state().has("line"));
        mach.handle_line(r#"{"id":1}"#);
        assert_eq!(mach.state().get_f64("line", 0.0), 12.0);
    }
}
