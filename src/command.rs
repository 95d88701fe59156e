//! Command correlation — pending-command registry and reply waiters.
//!
//! Every outbound command gets a process-wide monotonic id. The reply
//! carrying the same id completes exactly one waiter; waiters that lose
//! their transport are failed in bulk, and a waiter that timed out leaves
//! no residue (a late reply is a silent no-op).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::CommandError;
use crate::metrics::METRICS;
use crate::protocol::{CloseCode, Reply};

// Command ids start at 1; id 0 marks a server push on the wire.
static COMMAND_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate the next command id.
pub fn next_command_id() -> u32 {
    COMMAND_ID.fetch_add(1, Ordering::Relaxed)
}

/// Rewind the id counter. Only meaningful at process/init boundaries.
pub fn reset_command_ids() {
    COMMAND_ID.store(1, Ordering::Relaxed);
}

type PendingReplies = HashMap<u32, oneshot::Sender<Result<Reply, CommandError>>>;

/// Registry of commands awaiting replies.
#[derive(Clone, Default)]
pub struct CommandManager {
    pending: Arc<Mutex<PendingReplies>>,
}

impl CommandManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending command and hand back its waiter. Fails when the
    /// id is already pending.
    pub fn register(&self, id: u32, method: &'static str) -> Result<ReplyWaiter, CommandError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("pending lock");
        if pending.contains_key(&id) {
            return Err(CommandError::DuplicateId(id));
        }
        pending.insert(id, tx);
        Ok(ReplyWaiter {
            id,
            method,
            rx,
            started: Instant::now(),
            manager: self.clone(),
        })
    }

    /// Complete the waiter for this reply, if one is still pending. Late
    /// replies (after a timeout or disconnect) are dropped.
    pub fn on_reply(&self, reply: Reply) {
        let sender = self.pending.lock().expect("pending lock").remove(&reply.id);
        match sender {
            Some(tx) => {
                // receiver may already be gone, which is fine
                let _ = tx.send(Ok(reply));
            }
            None => trace!(id = reply.id, "no pending command for reply"),
        }
    }

    /// Fail every pending waiter because the transport dropped.
    pub fn on_disconnect(&self, code: CloseCode) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), %code, "failing pending commands");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(CommandError::Interrupted { code }));
        }
    }

    /// Fail and forget everything, used on client reset.
    pub fn clear(&self) {
        self.on_disconnect(CloseCode::Normal);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }

    fn forget(&self, id: u32) {
        self.pending.lock().expect("pending lock").remove(&id);
    }
}

/// One-shot handle resolving to the matching reply.
pub struct ReplyWaiter {
    id: u32,
    method: &'static str,
    rx: oneshot::Receiver<Result<Reply, CommandError>>,
    started: Instant,
    manager: CommandManager,
}

impl ReplyWaiter {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Suspend until the reply arrives, the timeout elapses, or the
    /// transport drops. Records the `command` histogram either way.
    pub async fn wait(self, timeout: Duration) -> Result<Reply, CommandError> {
        let result = match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            // registry dropped without completing us; treat as interrupted
            Ok(Err(_)) => Err(CommandError::Interrupted {
                code: CloseCode::Abnormal,
            }),
            Err(_) => {
                self.manager.forget(self.id);
                Err(CommandError::Timeout(timeout))
            }
        };

        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1_000.0;
        let success = matches!(&result, Ok(reply) if reply.error.is_none());
        METRICS.command(self.method, success, elapsed_ms);

        result
    }
}
