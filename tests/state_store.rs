//! Integration tests for the debounced state store

use krusty_ctrl::state::{Changes, ListenerResult, StateStore, StateValue};
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_millis(250);

/// A store with its start-up batch already delivered, and a listener that
/// records every batch it is called with.
fn recorded_store() -> (StateStore, Rc<RefCell<Vec<Changes>>>) {
    let mut state = StateStore::new(WINDOW);
    state.flush();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    state.add_listener(Box::new(move |changes: &Changes| -> ListenerResult {
        sink.borrow_mut().push(changes.clone());
        Ok(())
    }));
    (state, seen)
}

#[test]
fn test_new_listener_gets_full_state_first() {
    let (state, seen) = recorded_store();
    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], state.snapshot());
    assert_eq!(seen[0].get("xp"), Some(&StateValue::Number(0.0)));
}

#[test]
fn test_repeated_set_is_one_notification() {
    let (mut state, seen) = recorded_store();
    assert!(state.set("xp", 1.0));
    assert!(!state.set("xp", 1.0));

    let deadline = state.flush_deadline().unwrap();
    assert!(state.poll(deadline - Duration::from_millis(1)).is_none());
    let batch = state.poll(deadline).unwrap();

    let mut expected = Changes::new();
    expected.insert("xp".into(), StateValue::Number(1.0));
    assert_eq!(batch, expected);
    assert_eq!(seen.borrow().len(), 2);
    assert_eq!(seen.borrow()[1], expected);
    assert!(state.flush_deadline().is_none());
}

#[test]
fn test_failing_listener_does_not_stop_others() {
    let (mut state, seen) = recorded_store();
    state.add_listener(Box::new(|_: &Changes| -> ListenerResult {
        Err("display offline".into())
    }));
    state.set("yp", 3.0);
    state.flush();
    assert_eq!(seen.borrow().len(), 2);
    assert_eq!(state.listener_count(), 2);
}

#[test]
fn test_axis_names_follow_motor_assignment() {
    let mut state = StateStore::new(WINDOW);
    state.set("2an", 0.0);
    state.set("x_vm", 12.0);
    assert_eq!(state.get_f64("2vm", 0.0), 12.0);
    assert_eq!(state.resolve("x_vm"), "2vm");
    assert_eq!(state.resolve("c_vm"), "c_vm");
}

#[test]
fn test_empty_window_flushes_nothing() {
    let (mut state, seen) = recorded_store();
    assert!(state.poll(Instant::now() + WINDOW).is_none());
    assert!(state.flush().is_empty());
    assert_eq!(seen.borrow().len(), 1);
}

proptest! {
    #[test]
    fn test_last_write_in_window_wins(values in prop::collection::vec(-1000.0f64..1000.0, 1..20)) {
        let (mut state, seen) = recorded_store();
        state.set("zp", 5000.0);
        state.flush();
        for value in &values {
            state.set("zp", *value);
        }
        let batch = state.flush();
        prop_assert_eq!(batch.len(), 1);
        let expected = values.last().map(|v| StateValue::Number(*v));
        prop_assert_eq!(batch.get("zp"), expected.as_ref());
        prop_assert_eq!(seen.borrow().len(), 3);
    }
}
