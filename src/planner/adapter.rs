// src/planner/adapter.rs - Turns planned blocks into device commands
use super::{Block, BlockKind, PathPlanner, PlannerConfig, PlannerError, Program, axis_map, letter_map};
use crate::communication::codec::{CURVE_SLOTS, Command, LineCommand, PauseType};
use crate::communication::{CommandQueue, CommandSource};
use crate::machine::comm::QueuedAction;
use crate::state::{AXES, StateStore, StateValue};

/// Device switch number for a planner switch name.
pub fn switch_id(name: &str) -> Option<u8> {
    let id = match name {
        "estop" => 0,
        "probe" => 1,
        "x-min" => 2,
        "x-max" => 3,
        "y-min" => 4,
        "y-max" => 5,
        "z-min" => 6,
        "z-max" => 7,
        "a-min" => 8,
        "a-max" => 9,
        "stall-x" => 10,
        "stall-y" => 11,
        "stall-z" => 12,
        "stall-a" => 13,
        "motor-fault" => 14,
        _ => return None,
    };
    Some(id)
}

fn output_port(name: &str) -> Option<u8> {
    match name {
        "mist" => Some(1),
        "flood" => Some(2),
        _ => None,
    }
}

fn pause_type(optional: bool, name: Option<&str>) -> PauseType {
    match name {
        Some("optional") => PauseType::Optional,
        Some("pallet-change") => PauseType::PalletChange,
        Some("program") => PauseType::Program,
        _ if optional => PauseType::Optional,
        _ => PauseType::Program,
    }
}

/// Wraps the planner and feeds its output to the link. Side effects that
/// must happen in step with motion go through the command queue, tagged
/// with the id of the block they belong to.
pub struct PlannerAdapter {
    planner: Box<dyn PathPlanner>,
    /// Last id the device reported executing.
    active_id: u32,
    /// Last id sent to the device in a command.
    emitted_id: u32,
    /// Last id handed out by the planner, including side-effect blocks.
    issued_id: u32,
}

impl PlannerAdapter {
    pub fn new(planner: Box<dyn PathPlanner>) -> Self {
        Self {
            planner,
            active_id: 0,
            emitted_id: 0,
            issued_id: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.planner.is_running()
    }

    /// Motion remains planned or queued actions are waiting on the device.
    pub fn is_busy(&self, cmdq: &CommandQueue<QueuedAction>) -> bool {
        self.is_running() || cmdq.is_active()
    }

    pub fn is_synchronizing(&self) -> bool {
        self.planner.is_synchronizing()
    }

    pub fn synchronize(&mut self, offset: f64) {
        self.planner.synchronize(offset);
    }

    /// Limits and start position from the current machine state. Soft
    /// limits only apply to homed axes.
    pub fn config(state: &StateStore, with_limits: bool) -> PlannerConfig {
        let mut config = PlannerConfig {
            start: letter_map(&state.get_position()),
            metric: state.is_metric(),
            ..Default::default()
        };
        for axis in AXES {
            if !state.is_axis_enabled(axis) {
                continue;
            }
            let key = axis.letter().to_string();
            let var = |suffix: &str| state.get_f64(&format!("{}_{}", axis.letter(), suffix), 0.0);
            config.max_vel.insert(key.clone(), var("vm") * 1000.0);
            config.max_accel.insert(key.clone(), var("am") * 1000.0);
            config.max_jerk.insert(key.clone(), var("jm") * 1_000_000.0);
            if with_limits && state.is_axis_homed(axis) {
                let (min, max) = (var("tn"), var("tm"));
                if min < max {
                    config.min_soft_limit.insert(key.clone(), min);
                    config.max_soft_limit.insert(key, max);
                }
            }
        }
        config
    }

    pub fn load(
        &mut self,
        program: &Program,
        state: &StateStore,
        with_limits: bool,
    ) -> Result<(), PlannerError> {
        let config = Self::config(state, with_limits);
        self.planner.set_position(&config.start_position());
        self.planner.load(program, &config)
    }

    /// The device reports block `id` executing.
    pub fn set_active(&mut self, id: u32, cmdq: &mut CommandQueue<QueuedAction>) {
        self.active_id = id;
        self.planner.set_active(id);
        self.release(cmdq);
    }

    /// Release queued actions up to the active block. Side effects issued
    /// after the last device command carry ids the device never reports;
    /// once that command runs and nothing else is planned they are due.
    fn release(&mut self, cmdq: &mut CommandQueue<QueuedAction>) {
        let mut id = self.active_id;
        let exhausted = !self.planner.has_more() && !self.planner.is_synchronizing();
        if exhausted && id >= self.emitted_id {
            id = id.max(self.issued_id);
        }
        cmdq.release(id);
    }

    /// Re-sync the planner with the device position after a hold.
    pub fn restart(&mut self, state: &StateStore, cmdq: &mut CommandQueue<QueuedAction>) {
        let id = state.get_f64("id", 0.0).max(0.0) as u32;
        let position = state.get_position();
        tracing::info!("Planner restart at id {}", id);
        cmdq.clear();
        cmdq.release(id);
        self.planner.restart(id, &position);
        self.active_id = id;
        self.emitted_id = self.emitted_id.min(id);
        self.issued_id = self.issued_id.min(id);
    }

    /// Discard the plan and every queued action.
    pub fn reset(&mut self, cmdq: &mut CommandQueue<QueuedAction>) {
        self.planner.stop();
        cmdq.clear();
    }

    pub fn position_change(&mut self, state: &StateStore) {
        self.planner.set_position(&state.get_position());
    }

    /// Next device command, skipping blocks that only queue side effects.
    /// A planner failure stops the plan.
    pub fn next(&mut self, cmdq: &mut CommandQueue<QueuedAction>) -> Option<String> {
        while self.planner.has_more() {
            let block = match self.planner.next() {
                Ok(Some(block)) => block,
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!("Planner failed: {}", e);
                    self.reset(cmdq);
                    return None;
                }
            };
            if let Some(cmd) = self.encode(block, cmdq) {
                return Some(cmd);
            }
        }
        self.release(cmdq);
        None
    }

    fn enqueue_set(cmdq: &mut CommandQueue<QueuedAction>, id: u32, name: &str, value: StateValue) {
        cmdq.enqueue(
            id,
            false,
            QueuedAction::SetState {
                name: name.to_string(),
                value,
            },
        );
    }

    fn encode(&mut self, block: Block, cmdq: &mut CommandQueue<QueuedAction>) -> Option<String> {
        let id = block.id;
        self.issued_id = id;
        if !matches!(block.kind, BlockKind::Set { .. }) {
            tracing::debug!("Block {}: {:?}", id, block.kind);
        }
        let cmd = match block.kind {
            BlockKind::Line {
                target,
                exit_vel,
                max_accel,
                max_jerk,
                times,
            } => {
                let mut slots = [0.0f32; CURVE_SLOTS];
                for (slot, t) in slots.iter_mut().zip(times.iter()) {
                    *slot = *t as f32;
                }
                self.emitted_id = id;
                return Some(
                    Command::Line(LineCommand {
                        id,
                        exit_vel: exit_vel as f32,
                        max_accel: max_accel as f32,
                        max_jerk: max_jerk as f32,
                        target: axis_map(&target)
                            .into_iter()
                            .map(|(axis, v)| (axis, v as f32))
                            .collect(),
                        times: slots,
                    })
                    .encode(),
                );
            }
            BlockKind::Set { name, value } => {
                let Some(value) = StateValue::from_json(&value) else {
                    return None;
                };
                match name.as_str() {
                    "message" => cmdq.enqueue(id, false, QueuedAction::Message(value.to_string())),
                    "line" | "tool" => Self::enqueue_set(cmdq, id, &name, value),
                    "speed" => return Some(Command::Speed(value.as_f64()? as f32).encode()),
                    _ => {
                        if let Some(local) = name.strip_prefix('_') {
                            Self::enqueue_set(cmdq, id, local, value);
                        }
                    }
                }
                return None;
            }
            BlockKind::Dwell { seconds } => Command::Dwell(seconds as f32),
            BlockKind::Pause {
                optional,
                pause_type: kind,
            } => Command::Pause(pause_type(optional, kind.as_deref())),
            BlockKind::Seek {
                switch,
                active,
                error,
            } => match switch_id(&switch) {
                Some(switch) => Command::Seek {
                    switch,
                    active,
                    error,
                },
                None => {
                    tracing::error!("Unknown seek switch '{}'", switch);
                    return None;
                }
            },
            BlockKind::Output { port, value } => match output_port(&port) {
                Some(port) => Command::output(port, value != 0.0),
                None => {
                    tracing::error!("Unknown output '{}'", port);
                    return None;
                }
            },
        };
        self.emitted_id = id;
        Some(format!("#id={}\n{}", id, cmd.encode()))
    }
}

/// Offers the planner's next command to the link.
pub struct PlannerSource<'a> {
    pub planner: &'a mut PlannerAdapter,
    pub cmdq: &'a mut CommandQueue<QueuedAction>,
}

impl CommandSource for PlannerSource<'_> {
    fn next_command(&mut self) -> Option<String> {
        self.planner.next(self.cmdq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ScriptedPlanner;

    fn adapter_with(program: &str) -> PlannerAdapter {
        let mut adapter = PlannerAdapter::new(Box::new(ScriptedPlanner::new()));
        adapter
            .load(&Program::Text(program.into()), &StateStore::default(), true)
            .unwrap();
        adapter
    }

    #[test]
    fn test_set_blocks_wait_for_their_id() {
        let mut adapter = adapter_with(
            r#"{"id":1,"type":"set","name":"line","value":7}
{"id":2,"type":"dwell","seconds":1.0}"#,
        );
        let mut cmdq = CommandQueue::new();
        let cmd = adapter.next(&mut cmdq).unwrap();
        assert!(cmd.starts_with("#id=2\nd"));
        assert!(cmdq.is_active());
        assert!(cmdq.take_released().is_empty());

        adapter.set_active(2, &mut cmdq);
        assert_eq!(
            cmdq.take_released(),
            vec![QueuedAction::SetState {
                name: "line".into(),
                value: StateValue::Number(7.0)
            }]
        );
    }

    #[test]
    fn test_trailing_side_effects_follow_last_command() {
        let mut adapter = adapter_with(
            r#"{"id":1,"type":"dwell","seconds":1.0}
{"id":2,"type":"set","name":"line","value":9}
{"id":3,"type":"set","name":"message","value":"done"}"#,
        );
        let mut cmdq = CommandQueue::new();
        assert!(adapter.next(&mut cmdq).unwrap().starts_with("#id=1\nd"));
        assert!(adapter.next(&mut cmdq).is_none());
        assert!(cmdq.take_released().is_empty());

        adapter.set_active(1, &mut cmdq);
        assert_eq!(
            cmdq.take_released(),
            vec![
                QueuedAction::SetState {
                    name: "line".into(),
                    value: StateValue::Number(9.0)
                },
                QueuedAction::Message("done".into()),
            ]
        );
        assert!(!adapter.is_busy(&cmdq));
    }

    #[test]
    fn test_side_effect_only_program_releases_at_once() {
        let mut adapter = adapter_with(r#"{"id":1,"type":"set","name":"tool","value":2}"#);
        let mut cmdq = CommandQueue::new();
        assert!(adapter.next(&mut cmdq).is_none());
        assert_eq!(cmdq.take_released().len(), 1);
        assert!(!adapter.is_busy(&cmdq));
    }

    #[test]
    fn test_outputs_and_seek() {
        let mut adapter = adapter_with(
            r#"{"id":3,"type":"output","port":"flood","value":1}
{"id":4,"type":"seek","switch":"probe","active":true,"error":true}"#,
        );
        let mut cmdq = CommandQueue::new();
        assert_eq!(adapter.next(&mut cmdq).unwrap(), "#id=3\n#2oa=1");
        assert_eq!(adapter.next(&mut cmdq).unwrap(), "#id=4\ns13");
        assert!(adapter.is_synchronizing());
        assert!(adapter.next(&mut cmdq).is_none());
    }

    #[test]
    fn test_line_block_encoding() {
        let mut adapter = adapter_with(
            r#"{"id":9,"type":"line","target":{"x":1,"y":2},"exit-vel":0,"max-accel":1,"max-jerk":0,"times":[0,0,0,60000]}"#,
        );
        let mut cmdq = CommandQueue::new();
        let cmd = adapter.next(&mut cmdq).unwrap();
        match Command::parse(&cmd).unwrap() {
            Command::Line(line) => {
                assert_eq!(line.id, 9);
                assert_eq!(line.times[3], 60000.0);
                assert_eq!(line.target.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_switch_ids() {
        assert_eq!(switch_id("probe"), Some(1));
        assert_eq!(switch_id("stall-a"), Some(13));
        assert_eq!(switch_id("nope"), None);
    }
}
