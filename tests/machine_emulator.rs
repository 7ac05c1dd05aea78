//! End-to-end tests of the orchestrator against the emulated controller,
//! driven synchronously without a runtime.

use krusty_ctrl::communication::LinkError;
use krusty_ctrl::config::Config;
use krusty_ctrl::machine::{Cycle, Mach, MachOp, PauseReason, RunState};
use krusty_ctrl::planner::{Program, ScriptedPlanner};
use krusty_ctrl::simulator::{CATALOG, Emulator};
use krusty_ctrl::state::Axis;
use std::time::{Duration, Instant};

struct Bench {
    mach: Mach,
    emu: Emulator,
    clock: Instant,
}

impl Bench {
    fn new() -> Self {
        let mut bench = Self {
            mach: Mach::new(Config::default(), Box::new(ScriptedPlanner::new()), None),
            emu: Emulator::new(),
            clock: Instant::now(),
        };
        bench.mach.connect();
        bench.settle();
        bench
    }

    fn deliver(&mut self, lines: Vec<String>) {
        for line in lines {
            self.mach.receive(format!("{}\n", line).as_bytes());
        }
    }

    /// Write everything pending to the emulator and feed its replies back.
    fn pump(&mut self) -> bool {
        let mut sent = Vec::new();
        while let Some(bytes) = self.mach.pending_output() {
            let n = bytes.len();
            sent.push(String::from_utf8_lossy(bytes).into_owned());
            self.mach.advance_output(n);
        }
        for chunk in &sent {
            for line in chunk.lines() {
                let replies = self.emu.handle(line);
                self.deliver(replies);
            }
        }
        !sent.is_empty()
    }

    /// Run until nothing moves, letting every timer fire along the way.
    fn settle(&mut self) {
        for _ in 0..10 {
            while self.pump() {}
            self.clock += Duration::from_secs(1);
            self.mach.poll(self.clock);
        }
        while self.pump() {}
    }

    fn start(&mut self, program: &str) {
        self.mach
            .execute(MachOp::Start(Some(Program::Text(program.into()))))
            .unwrap();
    }
}

#[test]
fn test_connect_configures_and_dumps() {
    let bench = Bench::new();
    assert!(bench.mach.comm().reconnect_deadline().is_none());
    assert_eq!(bench.mach.state().machine_var_count(), CATALOG.len());
    assert_eq!(bench.mach.run_state(), Some(RunState::Ready));
    assert_eq!(bench.mach.state().get_f64("0vm", 0.0), 5.0);
}

#[test]
fn test_program_runs_to_idle() {
    let mut bench = Bench::new();
    bench.start(
        r#"{"type":"set","name":"line","value":7}
{"type":"line","target":{"x":10,"y":-2.5},"exit-vel":0,"max-accel":1000,"max-jerk":50000,"times":[10,0,10]}
{"type":"dwell","seconds":0.5}"#,
    );
    assert_eq!(bench.mach.cycle(), Cycle::Running);

    bench.settle();
    assert_eq!(bench.mach.cycle(), Cycle::Idle);
    assert!(!bench.mach.planner().is_running());
    assert_eq!(bench.mach.state().get_f64("xp", 0.0), 10.0);
    assert_eq!(bench.mach.state().get_f64("yp", 0.0), -2.5);
    assert_eq!(bench.mach.state().get_f64("line", 0.0), 7.0);
    assert_eq!(bench.mach.state().get_f64("id", 0.0), 3.0);
}

#[test]
fn test_program_ending_in_message_returns_to_idle() {
    let mut bench = Bench::new();
    bench.start(
        r#"{"type":"line","target":{"x":10},"exit-vel":0,"max-accel":1000,"max-jerk":50000,"times":[10]}
{"type":"set","name":"message","value":"done"}"#,
    );
    bench.settle();

    assert_eq!(bench.mach.cycle(), Cycle::Idle);
    assert!(!bench.mach.planner().is_running());
    assert!(!bench.mach.cmdq().is_active());
    assert_eq!(bench.mach.state().get_str("message", ""), "done");
}

#[test]
fn test_estop_discards_program_until_cleared() {
    let mut bench = Bench::new();
    bench.start(
        r#"{"type":"dwell","seconds":5}
{"type":"dwell","seconds":5}"#,
    );
    bench.mach.execute(MachOp::Estop).unwrap();
    bench.settle();

    assert_eq!(bench.mach.run_state(), Some(RunState::Estopped));
    assert!(!bench.mach.planner().is_running());
    assert_eq!(bench.mach.cycle(), Cycle::Idle);
    assert!(bench.mach.cmdq().is_empty());

    bench.mach.execute(MachOp::Clear).unwrap();
    bench.settle();
    assert_eq!(bench.mach.run_state(), Some(RunState::Ready));
    assert_eq!(bench.emu.run_state(), "READY");
}

#[test]
fn test_seek_continues_after_switch_found() {
    let mut bench = Bench::new();
    bench.start(
        r#"{"type":"seek","switch":"probe","active":true,"error":true}
{"type":"line","target":{"z":-1},"exit-vel":0,"max-accel":1000,"max-jerk":50000,"times":[10]}"#,
    );
    bench.settle();

    assert_eq!(bench.emu.run_state(), "READY");
    assert_eq!(bench.mach.pause_reason(), None);
    assert!(!bench.mach.is_unpausing());
    assert_eq!(bench.mach.state().get_f64("zp", 0.0), -1.0);
    assert_eq!(bench.mach.cycle(), Cycle::Idle);
}

#[test]
fn test_optional_pause_continues_unless_enabled() {
    let mut bench = Bench::new();
    bench.start(
        r#"{"type":"pause","optional":true}
{"type":"dwell","seconds":0.1}"#,
    );
    bench.settle();
    assert_eq!(bench.mach.run_state(), Some(RunState::Ready));
    assert_eq!(bench.mach.cycle(), Cycle::Idle);

    bench.mach.state_mut().set("optional_pause", true);
    bench.start(
        r#"{"type":"pause","optional":true}
{"type":"dwell","seconds":0.1}"#,
    );
    bench.settle();
    assert_eq!(bench.mach.run_state(), Some(RunState::Holding));
    assert_eq!(bench.mach.pause_reason(), Some(PauseReason::OptionalPause));
}

#[test]
fn test_program_pause_waits_for_user() {
    let mut bench = Bench::new();
    bench.start(
        r#"{"type":"pause"}
{"type":"line","target":{"x":4},"exit-vel":0,"max-accel":1000,"max-jerk":50000,"times":[10]}"#,
    );
    bench.settle();
    assert_eq!(bench.mach.run_state(), Some(RunState::Holding));
    assert_eq!(bench.mach.pause_reason(), Some(PauseReason::ProgramPause));
    assert_eq!(bench.mach.cycle(), Cycle::Running);
    assert_eq!(bench.mach.state().get_f64("xp", 0.0), 0.0);

    bench.mach.execute(MachOp::Unpause).unwrap();
    bench.settle();
    assert_eq!(bench.mach.run_state(), Some(RunState::Ready));
    assert_eq!(bench.mach.state().get_f64("xp", 0.0), 4.0);
    assert_eq!(bench.mach.cycle(), Cycle::Idle);
}

#[test]
fn test_device_error_discards_plan() {
    let mut bench = Bench::new();
    bench.start(
        r#"{"type":"dwell","seconds":5}
{"type":"dwell","seconds":5}"#,
    );
    bench
        .mach
        .handle_line(r#"{"msg":"Step rate too high","level":"warning"}"#);
    assert!(bench.mach.planner().is_running());

    bench
        .mach
        .handle_line(r#"{"msg":"Motor overheat","level":"error","where":"motor.c:12"}"#);
    assert!(!bench.mach.planner().is_running());
    assert!(bench.mach.cmdq().is_empty());

    bench.settle();
    assert_eq!(bench.mach.cycle(), Cycle::Idle);
    assert_eq!(bench.mach.run_state(), Some(RunState::Ready));
}

#[test]
fn test_link_error_resynchronizes() {
    let mut bench = Bench::new();
    bench.start(
        r#"{"type":"dwell","seconds":5}
{"type":"dwell","seconds":5}"#,
    );
    bench.mach.io_error(&LinkError::Closed);
    assert!(!bench.mach.planner().is_running());
    assert!(bench.mach.comm().reconnect_deadline().is_some());

    bench.settle();
    assert!(bench.mach.comm().reconnect_deadline().is_none());
    assert_eq!(bench.mach.run_state(), Some(RunState::Ready));
    assert_eq!(bench.mach.cycle(), Cycle::Idle);
}

#[test]
fn test_motor_fault_raised_and_cleared() {
    let mut bench = Bench::new();
    // Bit 5 is outside the driver fault mask.
    bench.mach.receive(b"{\"1df\":32}\n");
    bench.settle();
    assert!(bench.mach.faulted_motors().is_empty());

    bench.mach.receive(b"{\"1df\":4,\"2df\":1}\n");
    bench.settle();
    assert_eq!(bench.mach.faulted_motors(), vec![1, 2]);

    bench.mach.receive(b"{\"1df\":0}\n");
    bench.settle();
    assert_eq!(bench.mach.faulted_motors(), vec![2]);
}

#[test]
fn test_malformed_telemetry_between_good_lines() {
    let mut bench = Bench::new();
    bench.mach.receive(b"{oops\n{\"xp\":3}\n\x00\xff\n");
    assert_eq!(bench.mach.state().get_f64("xp", 0.0), 3.0);
    assert_eq!(bench.mach.run_state(), Some(RunState::Ready));
}

#[test]
fn test_reboot_resynchronizes() {
    let mut bench = Bench::new();
    bench
        .mach
        .execute(MachOp::SetPosition {
            axis: Axis::X,
            position: 12.0,
        })
        .unwrap();
    bench.settle();
    assert_eq!(bench.mach.state().get_f64("xp", 0.0), 12.0);

    bench.mach.execute(MachOp::Reboot).unwrap();
    bench.settle();
    assert!(bench.mach.comm().reconnect_deadline().is_none());
    assert_eq!(bench.mach.run_state(), Some(RunState::Ready));
    // The host pushes its last known position back to the fresh device.
    assert_eq!(bench.mach.state().get_f64("xp", 0.0), 12.0);
}
