//! Concurrency gate between local capture and remote application.
//!
//! While remote operations are being applied (and for a short cooldown
//! afterwards) the engine is "in the sync window". Local commands arriving
//! then are buffered instead of persisted, and selector-driven side effects
//! should suppress themselves. When application ends the buffer is drained in
//! arrival order and every command is persisted with a freshly computed clock,
//! so it causally follows the history that was just merged.
//!
//! Commands keep queueing behind the buffer until the drain has written the
//! last of them, so a command never overtakes one that arrived before it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::operation::{EntityChange, PersistentCommand};

/// A command together with the entity changes extracted when it was captured.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedCommand {
    pub command: PersistentCommand,
    pub entity_changes: Vec<EntityChange>,
}

impl CapturedCommand {
    pub fn new(command: PersistentCommand, entity_changes: Vec<EntityChange>) -> Self {
        Self {
            command,
            entity_changes,
        }
    }
}

#[derive(Default)]
struct DeferredBuffer {
    commands: VecDeque<CapturedCommand>,
    /// A drain has popped a command and not yet come back for the next one
    draining: bool,
}

pub struct HydrationState {
    applying_remote_ops: AtomicBool,
    cooldown_until: Mutex<Option<Instant>>,
    cooldown: Duration,
    deferred: Mutex<DeferredBuffer>,
    deferred_warn_threshold: usize,
}

impl HydrationState {
    pub fn new(cooldown: Duration, deferred_warn_threshold: usize) -> Self {
        Self {
            applying_remote_ops: AtomicBool::new(false),
            cooldown_until: Mutex::new(None),
            cooldown,
            deferred: Mutex::new(DeferredBuffer::default()),
            deferred_warn_threshold,
        }
    }

    /// True strictly while remote operations are being applied.
    #[must_use]
    pub fn is_applying_remote_ops(&self) -> bool {
        self.applying_remote_ops.load(Ordering::Acquire)
    }

    /// True during the post-sync cooldown.
    #[must_use]
    pub fn is_in_cooldown(&self) -> bool {
        self.cooldown_until
            .lock()
            .is_some_and(|until| Instant::now() < until)
    }

    /// Applying remote operations, or shortly after.
    #[must_use]
    pub fn is_in_sync_window(&self) -> bool {
        self.is_applying_remote_ops() || self.is_in_cooldown()
    }

    pub fn start_applying_remote_ops(&self) {
        debug!("Applying remote operations");
        self.applying_remote_ops.store(true, Ordering::Release);
        *self.cooldown_until.lock() = None;
    }

    /// Clear the applying flag and start the cooldown.
    pub fn end_applying_remote_ops(&self) {
        self.applying_remote_ops.store(false, Ordering::Release);
        *self.cooldown_until.lock() = Some(Instant::now() + self.cooldown);
        debug!(cooldown = ?self.cooldown, "Finished applying remote operations");
    }

    /// RAII form of start/end: the flag clears when the guard drops, even on error paths.
    #[must_use = "the sync window closes as soon as the guard is dropped"]
    pub fn applying_guard(&self) -> ApplyingRemoteOpsGuard<'_> {
        self.start_applying_remote_ops();
        ApplyingRemoteOpsGuard { state: self }
    }

    /// Buffer a command captured during remote application. Never drops.
    pub fn defer(&self, captured: CapturedCommand) {
        let mut buffer = self.deferred.lock();
        self.push_locked(&mut buffer, captured);
    }

    /// Buffer `captured` if remote operations are being applied or earlier
    /// commands are still waiting to be persisted. Otherwise hand it back.
    pub fn defer_if_blocked(&self, captured: CapturedCommand) -> Option<CapturedCommand> {
        let mut buffer = self.deferred.lock();
        let blocked = self.is_applying_remote_ops() || buffer.draining || !buffer.commands.is_empty();
        if !blocked {
            return Some(captured);
        }
        self.push_locked(&mut buffer, captured);
        None
    }

    fn push_locked(&self, buffer: &mut DeferredBuffer, captured: CapturedCommand) {
        buffer.commands.push_back(captured);
        let len = buffer.commands.len();

        crate::metrics::set_deferred_commands(len);
        // Warn once when crossing the threshold
        if len == self.deferred_warn_threshold + 1 {
            warn!(
                buffered = len,
                "Deferred command buffer is growing; remote sync may be stuck"
            );
        }
    }

    /// Pop the oldest buffered command for persisting.
    ///
    /// Until this returns `None` the drain counts as running and new commands
    /// keep buffering. Returns `None` while remote operations are being
    /// applied; that window's own drain picks the buffer up.
    pub fn next_deferred(&self) -> Option<CapturedCommand> {
        let mut buffer = self.deferred.lock();
        let next = if self.is_applying_remote_ops() {
            None
        } else {
            buffer.commands.pop_front()
        };
        buffer.draining = next.is_some();
        crate::metrics::set_deferred_commands(buffer.commands.len());
        next
    }

    /// Take every buffered command in arrival order.
    pub fn take_deferred(&self) -> Vec<CapturedCommand> {
        let taken: Vec<_> = self.deferred.lock().commands.drain(..).collect();
        crate::metrics::set_deferred_commands(0);
        taken
    }

    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().commands.len()
    }
}

/// Clears the applying-remote-ops flag on drop.
pub struct ApplyingRemoteOpsGuard<'a> {
    state: &'a HydrationState,
}

impl Drop for ApplyingRemoteOpsGuard<'_> {
    fn drop(&mut self) {
        self.state.end_applying_remote_ops();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OpType;
    use serde_json::json;

    fn captured(n: u32) -> CapturedCommand {
        CapturedCommand::new(
            PersistentCommand::new("[Task] Update", OpType::Update, "TASK", json!({"n": n}))
                .with_entity_id(format!("t{n}")),
            vec![],
        )
    }

    #[test]
    fn test_flags_start_clear() {
        let state = HydrationState::new(Duration::from_millis(50), 10);
        assert!(!state.is_applying_remote_ops());
        assert!(!state.is_in_sync_window());
    }

    #[test]
    fn test_window_covers_application_and_cooldown() {
        let state = HydrationState::new(Duration::from_secs(60), 10);
        state.start_applying_remote_ops();
        assert!(state.is_applying_remote_ops());
        assert!(state.is_in_sync_window());

        state.end_applying_remote_ops();
        assert!(!state.is_applying_remote_ops());
        assert!(state.is_in_cooldown());
        assert!(state.is_in_sync_window());
    }

    #[test]
    fn test_cooldown_expires() {
        let state = HydrationState::new(Duration::from_millis(5), 10);
        state.start_applying_remote_ops();
        state.end_applying_remote_ops();
        std::thread::sleep(Duration::from_millis(15));
        assert!(!state.is_in_sync_window());
    }

    #[test]
    fn test_guard_ends_on_drop() {
        let state = HydrationState::new(Duration::ZERO, 10);
        {
            let _guard = state.applying_guard();
            assert!(state.is_applying_remote_ops());
        }
        assert!(!state.is_applying_remote_ops());
    }

    #[test]
    fn test_deferred_keeps_order_and_never_drops() {
        let state = HydrationState::new(Duration::ZERO, 2);
        for n in 0..5 {
            state.defer(captured(n));
        }
        assert_eq!(state.deferred_len(), 5);

        let drained = state.take_deferred();
        let order: Vec<_> = drained
            .iter()
            .map(|c| c.command.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(state.deferred_len(), 0);
    }

    #[test]
    fn test_commands_queue_behind_buffer_until_drain_finishes() {
        let state = HydrationState::new(Duration::ZERO, 10);
        {
            let _guard = state.applying_guard();
            assert!(state.defer_if_blocked(captured(0)).is_none());
        }

        // Window closed but the buffer is not empty
        assert!(state.defer_if_blocked(captured(1)).is_none());

        assert_eq!(state.next_deferred().unwrap().command.payload["n"], 0);
        assert_eq!(state.next_deferred().unwrap().command.payload["n"], 1);
        // The last popped command is still being written
        assert!(state.defer_if_blocked(captured(2)).is_none());
        assert_eq!(state.next_deferred().unwrap().command.payload["n"], 2);
        assert!(state.next_deferred().is_none());

        assert!(state.defer_if_blocked(captured(3)).is_some());
    }

    #[test]
    fn test_drain_pauses_while_remote_ops_apply() {
        let state = HydrationState::new(Duration::ZERO, 10);
        state.defer(captured(0));
        let guard = state.applying_guard();
        assert!(state.next_deferred().is_none());
        assert_eq!(state.deferred_len(), 1);
        drop(guard);
        assert!(state.next_deferred().is_some());
    }
}
