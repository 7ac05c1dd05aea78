//! Runs the controller loop against the emulator over an in-memory port

use krusty_ctrl::communication::serial::DevicePort;
use krusty_ctrl::config::Config;
use krusty_ctrl::ctrl::Ctrl;
use krusty_ctrl::hardware::i2c;
use krusty_ctrl::machine::MachOp;
use krusty_ctrl::planner::{Program, ScriptedPlanner};
use krusty_ctrl::simulator::{EmulatedBus, Emulator};
use krusty_ctrl::state::{Changes, StateValue};
use krusty_ctrl::web::ctrl_channel::CtrlRequest;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, LocalSet};

fn fast_config() -> Config {
    let mut config = Config::default();
    config.timing.state_flush_ms = 10;
    config.timing.cycle_check_ms = 20;
    config.timing.power_poll_ms = 50;
    config
}

/// Start the emulator and a controller talking to it over serial and the
/// emulated I2C bus. Aborting the returned task closes the device's end.
fn spawn_pair() -> (mpsc::Sender<CtrlRequest>, JoinHandle<std::io::Result<()>>) {
    let config = fast_config();
    let (host, device) = tokio::io::duplex(256);
    let (bus, i2c_rx) = EmulatedBus::new(config.i2c.avr_address, config.i2c.power_address);
    let emulator = tokio::task::spawn_local(Emulator::new().run(device, i2c_rx));

    let ctrl = Ctrl::new(config, Box::new(ScriptedPlanner::new()), Some(i2c::shared(bus))).unwrap();
    let (tx, rx) = mpsc::channel(16);
    let port: DevicePort = Box::new(host);
    tokio::task::spawn_local(ctrl.run(Some(port), rx));
    (tx, emulator)
}

async fn state(tx: &mpsc::Sender<CtrlRequest>) -> Changes {
    let (respond_to, rx) = oneshot::channel();
    tx.send(CtrlRequest::GetState { respond_to }).await.unwrap();
    rx.await.unwrap()
}

async fn execute(tx: &mpsc::Sender<CtrlRequest>, op: MachOp) -> Result<(), String> {
    let (respond_to, rx) = oneshot::channel();
    tx.send(CtrlRequest::Command { op, respond_to }).await.unwrap();
    rx.await.unwrap()
}

/// Poll the state until `done` holds.
async fn wait_for(tx: &mpsc::Sender<CtrlRequest>, done: impl Fn(&Changes) -> bool) -> Changes {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = state(tx).await;
            if done(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("controller did not reach the expected state")
}

fn text(state: &Changes, key: &str) -> Option<String> {
    state.get(key).and_then(StateValue::as_str).map(str::to_string)
}

#[tokio::test]
async fn test_program_runs_over_the_port() {
    LocalSet::new()
        .run_until(async {
            let (tx, _emulator) = spawn_pair();
            wait_for(&tx, |s| text(s, "xx").as_deref() == Some("READY")).await;

            let program = r#"{"type":"line","target":{"x":10},"exit-vel":0,"max-accel":1000,"max-jerk":50000,"times":[10]}
{"type":"set","name":"line","value":2}
{"type":"line","target":{"x":10,"y":5},"exit-vel":0,"max-accel":1000,"max-jerk":50000,"times":[10]}"#;
            execute(&tx, MachOp::Start(Some(Program::Text(program.into()))))
                .await
                .unwrap();

            let done = wait_for(&tx, |s| {
                text(s, "cycle").as_deref() == Some("idle") && s.get("yp") == Some(&StateValue::Number(5.0))
            })
            .await;
            assert_eq!(done.get("xp"), Some(&StateValue::Number(10.0)));
            assert_eq!(done.get("line"), Some(&StateValue::Number(2.0)));
        })
        .await;
}

#[tokio::test]
async fn test_pause_over_i2c_and_power_readings() {
    LocalSet::new()
        .run_until(async {
            let (tx, _emulator) = spawn_pair();
            wait_for(&tx, |s| text(s, "xx").as_deref() == Some("READY")).await;

            let state = wait_for(&tx, |s| s.contains_key("vin")).await;
            assert_eq!(state.get("vin"), Some(&StateValue::Number(36.0)));

            execute(&tx, MachOp::Pause).await.unwrap();
            let held = wait_for(&tx, |s| text(s, "xx").as_deref() == Some("HOLDING")).await;
            assert_eq!(text(&held, "pr").as_deref(), Some("User pause"));

            execute(&tx, MachOp::Unpause).await.unwrap();
            wait_for(&tx, |s| text(s, "xx").as_deref() == Some("READY")).await;
        })
        .await;
}

#[tokio::test]
async fn test_subscribers_see_change_batches() {
    LocalSet::new()
        .run_until(async {
            let (tx, _emulator) = spawn_pair();
            let (respond_to, rx) = oneshot::channel();
            tx.send(CtrlRequest::Subscribe { respond_to }).await.unwrap();
            let (snapshot, mut events) = rx.await.unwrap();
            assert!(snapshot.contains_key("cycle"));

            let ready = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let batch = events.recv().await.unwrap();
                    if batch.get("xx").and_then(StateValue::as_str) == Some("READY") {
                        return batch;
                    }
                }
            })
            .await
            .unwrap();
            assert!(ready.contains_key("xx"));
        })
        .await;
}

#[tokio::test]
async fn test_lost_port_keeps_serving() {
    LocalSet::new()
        .run_until(async {
            let (tx, emulator) = spawn_pair();
            wait_for(&tx, |s| text(s, "xx").as_deref() == Some("READY")).await;

            emulator.abort();
            let _ = emulator.await;
            tokio::time::sleep(Duration::from_millis(50)).await;

            // Detached: commands are accepted and their output dropped.
            execute(&tx, MachOp::Mdi("$xx=1".into())).await.unwrap();
            execute(&tx, MachOp::Pause).await.unwrap();
            let state = state(&tx).await;
            assert_eq!(text(&state, "cycle").as_deref(), Some("idle"));
        })
        .await;
}
