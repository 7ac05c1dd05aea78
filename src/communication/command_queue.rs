// src/communication/command_queue.rs - Id-gated in-order release of queued actions
//!
//! Entries are released strictly in enqueue order. A non-immediate entry
//! waits at the head until [`CommandQueue::release`] has authorised its id;
//! everything behind a blocked head waits with it, immediate or not.
//!
//! Released payloads are not executed by the queue. They are moved to a
//! ready list that the owner drains with [`CommandQueue::take_released`] and
//! applies one by one, so a failing payload never stops the ones after it.

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
enum Action<T> {
    Run(T),
    /// Reset all sequencing state, then release the payload.
    Flush(T),
}

#[derive(Debug, Clone, PartialEq)]
struct Entry<T> {
    id: u32,
    immediate: bool,
    action: Action<T>,
}

#[derive(Debug)]
pub struct CommandQueue<T> {
    entries: VecDeque<Entry<T>>,
    ready: VecDeque<T>,
    release_id: u32,
    last_enqueue_id: u32,
    strict: bool,
}

impl<T> CommandQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            ready: VecDeque::new(),
            release_id: 0,
            last_enqueue_id: 0,
            strict: false,
        }
    }

    /// A queue that treats a release-id regression as a bug in debug builds.
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::new()
        }
    }

    pub fn enqueue(&mut self, id: u32, immediate: bool, payload: T) {
        if !immediate {
            self.last_enqueue_id = id;
        }
        self.entries.push_back(Entry {
            id,
            immediate,
            action: Action::Run(payload),
        });
        self.release_pass();
    }

    /// Advance the release watermark. A regression is logged and accepted.
    pub fn release(&mut self, id: u32) {
        if id < self.release_id {
            tracing::warn!(
                "Release id regressed from {} to {}",
                self.release_id,
                id
            );
            if self.strict {
                debug_assert!(id >= self.release_id, "release id regression");
            }
        }
        self.release_id = id;
        self.release_pass();
    }

    /// Enqueue a barrier that, once it reaches the head, drops every entry
    /// behind it, zeroes the counters and releases `payload`.
    pub fn flush(&mut self, payload: T) {
        let id = self.last_enqueue_id;
        self.entries.push_back(Entry {
            id,
            immediate: true,
            action: Action::Flush(payload),
        });
        self.release_pass();
    }

    /// Drop every queued entry and zero the counters. Already released
    /// payloads stay in the ready list.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.release_id = 0;
        self.last_enqueue_id = 0;
    }

    fn release_pass(&mut self) {
        while let Some(head) = self.entries.front() {
            if !head.immediate && head.id > self.release_id {
                break;
            }
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            match entry.action {
                Action::Run(payload) => self.ready.push_back(payload),
                Action::Flush(payload) => {
                    tracing::debug!("Command queue flushed at id {}", entry.id);
                    self.clear();
                    self.ready.push_back(payload);
                }
            }
        }
    }

    /// Payloads released since the last call, in release order.
    pub fn take_released(&mut self) -> Vec<T> {
        self.ready.drain(..).collect()
    }

    pub fn has_released(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn is_active(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn release_id(&self) -> u32 {
        self.release_id
    }

    pub fn last_enqueue_id(&self) -> u32 {
        self.last_enqueue_id
    }
}

impl<T> Default for CommandQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_until_released() {
        let mut q = CommandQueue::new();
        for id in 1..=3 {
            q.enqueue(id, false, id);
        }
        assert!(q.is_active());
        assert!(q.take_released().is_empty());

        q.release(2);
        assert_eq!(q.take_released(), vec![1, 2]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_immediate_waits_behind_blocked_head() {
        let mut q = CommandQueue::new();
        q.enqueue(1, false, "line");
        q.enqueue(0, true, "resume");
        assert!(q.take_released().is_empty());
        q.release(1);
        assert_eq!(q.take_released(), vec!["line", "resume"]);
    }

    #[test]
    fn test_immediate_at_head_releases() {
        let mut q = CommandQueue::new();
        q.enqueue(5, true, "now");
        assert_eq!(q.take_released(), vec!["now"]);
        assert!(!q.is_active());
    }

    #[test]
    fn test_regression_is_accepted() {
        let mut q: CommandQueue<u32> = CommandQueue::new();
        q.release(10);
        q.release(4);
        assert_eq!(q.release_id(), 4);
    }

    #[test]
    fn test_flush_resets_counters() {
        let mut q = CommandQueue::new();
        q.enqueue(1, false, "a");
        q.enqueue(2, false, "b");
        q.flush("done");
        q.enqueue(3, false, "after");
        assert_eq!(q.last_enqueue_id(), 3);

        q.release(2);
        assert_eq!(q.take_released(), vec!["a", "b", "done"]);
        assert!(!q.is_active());
        assert_eq!(q.release_id(), 0);
        assert_eq!(q.last_enqueue_id(), 0);
    }

    #[test]
    fn test_clear_keeps_released() {
        let mut q = CommandQueue::new();
        q.enqueue(0, true, 1);
        q.enqueue(9, false, 2);
        q.clear();
        assert!(!q.is_active());
        assert_eq!(q.take_released(), vec![1]);
    }
}
