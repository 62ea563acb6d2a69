//! Per-segment retransmission timers.
//!
//! Reliable delivery requires that every unacknowledged segment is re-sent if
//! no ACK arrives within a bounded time.  Selective Repeat keeps one timer per
//! outstanding segment, so this module provides a [`TimerRegistry`]: a map
//! from sequence number to a cancelable one-shot tokio task.
//!
//! - [`TimerRegistry::arm`] replaces any pending timer for the same id, so an
//!   id never has two live timers.
//! - [`TimerRegistry::disarm`] cancels and forgets a timer.
//! - Every arming gets a fresh generation, carried to the callback in a
//!   [`TimerToken`].  A timer that already fired and is waiting for the
//!   session lock when it is disarmed or re-armed is recognised as stale via
//!   [`TimerRegistry::is_current`].
//!
//! The timeout itself is fixed per session; there is no RTT estimation.

use std::collections::HashMap;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Identifies one particular arming of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    /// The id the timer was armed for (a sequence number).
    pub id: u32,
    /// Distinguishes successive armings of the same id.
    pub generation: u64,
}

#[derive(Debug)]
struct Armed {
    generation: u64,
    task: JoinHandle<()>,
}

/// Owns one cancelable, restartable timer per id.
///
/// Timer tasks are spawned on the runtime captured at construction, so the
/// registry can be driven from any thread.
#[derive(Debug)]
pub struct TimerRegistry {
    runtime: Handle,
    next_generation: u64,
    armed: HashMap<u32, Armed>,
}

impl TimerRegistry {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_generation: 0,
            armed: HashMap::new(),
        }
    }

    /// Schedule `on_expire` to run once after `delay`, replacing any timer
    /// already armed for `id`.
    pub fn arm<F>(&mut self, id: u32, delay: Duration, on_expire: F) -> TimerToken
    where
        F: FnOnce(TimerToken) + Send + 'static,
    {
        self.disarm(id);

        self.next_generation += 1;
        let token = TimerToken {
            id,
            generation: self.next_generation,
        };
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            on_expire(token);
        });
        self.armed.insert(
            id,
            Armed {
                generation: token.generation,
                task,
            },
        );
        token
    }

    /// Cancel and remove the timer for `id`.  Returns `false` if none was armed.
    pub fn disarm(&mut self, id: u32) -> bool {
        match self.armed.remove(&id) {
            Some(armed) => {
                armed.task.abort();
                true
            }
            None => false,
        }
    }

    /// `true` when `token` belongs to the timer currently armed for its id.
    pub fn is_current(&self, token: TimerToken) -> bool {
        self.armed
            .get(&token.id)
            .is_some_and(|armed| armed.generation == token.generation)
    }

    pub fn is_armed(&self, id: u32) -> bool {
        self.armed.contains_key(&id)
    }

    /// Number of ids holding a timer.
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Cancel every timer.
    pub fn clear(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.task.abort();
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(20);
    const SETTLE: Duration = Duration::from_millis(150);

    fn registry() -> TimerRegistry {
        TimerRegistry::new(Handle::current())
    }

    #[tokio::test]
    async fn armed_timer_fires_once() {
        let mut timers = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let token = timers.arm(7, SHORT, move |t| {
            let _ = tx.send(t);
        });

        let fired = timeout(SETTLE, rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired, token);
        assert!(timers.is_current(fired));
        // The sender half was moved into the callback and dropped after firing.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn rearm_replaces_pending_timer() {
        let mut timers = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        let first = timers.arm(1, SHORT, move |t| {
            let _ = tx1.send(t);
        });
        let second = timers.arm(1, SHORT, move |t| {
            let _ = tx.send(t);
        });
        assert_eq!(timers.len(), 1);
        assert!(!timers.is_current(first));

        let fired = timeout(SETTLE, rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired, second);
        assert!(rx.recv().await.is_none(), "replaced timer must not fire");
    }

    #[tokio::test]
    async fn disarm_prevents_expiry() {
        let mut timers = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let token = timers.arm(3, SHORT, move |t| {
            let _ = tx.send(t);
        });
        assert!(timers.disarm(3));
        assert!(!timers.disarm(3), "second disarm is a no-op");
        assert!(!timers.is_current(token));
        assert!(timers.is_empty());

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn clear_cancels_everything() {
        let mut timers = registry();
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerToken>();

        for id in 0..4 {
            let tx = tx.clone();
            timers.arm(id, SHORT, move |t| {
                let _ = tx.send(t);
            });
        }
        drop(tx);
        assert_eq!(timers.len(), 4);

        timers.clear();
        assert!(timers.is_empty());
        assert!(rx.recv().await.is_none());
    }
}
