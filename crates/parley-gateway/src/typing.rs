//! Ephemeral "is typing" state with automatic expiry.
//!
//! Each (sender, recipient) pair is either idle (no entry) or typing. Typing
//! means the sender is in the recipient's typing set *and* an expiry timer is
//! armed for the pair; both are always added and removed together under one
//! lock. Every transition back to idle sends `user_typing{isTyping:false}` to
//! the recipient.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use parley_types::frames::ServerFrame;

use crate::registry::ConnectionRegistry;

/// How long a typing indicator lives without a refresh.
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TypingKey {
    sender: String,
    recipient: String,
}

impl TypingKey {
    fn new(sender: &str, recipient: &str) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
        }
    }
}

struct Timer {
    /// Distinguishes this arming from earlier ones for the same pair, so an
    /// expiry that lost the race with a re-arm or stop does nothing.
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TypingState {
    /// recipient -> senders currently typing toward them
    typing_to: HashMap<String, HashSet<String>>,
    timers: HashMap<TypingKey, Timer>,
    next_generation: u64,
}

impl TypingState {
    /// Remove both the timer and the set membership for `key`.
    /// Returns the timer if the pair was typing.
    fn remove(&mut self, key: &TypingKey) -> Option<Timer> {
        let timer = self.timers.remove(key)?;
        if let Some(senders) = self.typing_to.get_mut(&key.recipient) {
            senders.remove(&key.sender);
            if senders.is_empty() {
                self.typing_to.remove(&key.recipient);
            }
        }
        Some(timer)
    }
}

#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<TypingInner>,
}

struct TypingInner {
    registry: ConnectionRegistry,
    timeout: Duration,
    state: Mutex<TypingState>,
}

impl TypingTracker {
    pub fn new(registry: ConnectionRegistry, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                registry,
                timeout,
                state: Mutex::new(TypingState::default()),
            }),
        }
    }

    /// `typing_start`: enter or refresh the typing state. The recipient is
    /// only notified on the idle -> typing edge.
    pub fn start(&self, sender: &str, recipient: &str) {
        let key = TypingKey::new(sender, recipient);

        let newly_typing = {
            let mut state = self.lock();
            state.next_generation += 1;
            let generation = state.next_generation;

            let handle = self.spawn_expiry(key.clone(), generation);
            if let Some(previous) = state.timers.insert(key.clone(), Timer { generation, handle }) {
                previous.handle.abort();
            }

            state
                .typing_to
                .entry(key.recipient.clone())
                .or_default()
                .insert(key.sender.clone())
        };

        if newly_typing {
            debug!(sender = %sender, recipient = %recipient, "Typing started");
            self.notify(&key, true);
        } else {
            trace!(sender = %sender, recipient = %recipient, "Typing refreshed");
        }
    }

    /// `typing_stop`, or an implicit stop such as sending a message.
    /// Returns false (and sends nothing) if the pair was not typing.
    pub fn stop(&self, sender: &str, recipient: &str) -> bool {
        let key = TypingKey::new(sender, recipient);

        let Some(timer) = self.lock().remove(&key) else {
            return false;
        };
        timer.handle.abort();

        debug!(sender = %sender, recipient = %recipient, "Typing stopped");
        self.notify(&key, false);
        true
    }

    /// Stop every indicator `sender` has toward anyone. Called when the
    /// sender's connection closes. Returns how many were stopped.
    pub fn clear_sender(&self, sender: &str) -> usize {
        let stopped: Vec<TypingKey> = {
            let mut state = self.lock();
            let keys: Vec<TypingKey> = state
                .timers
                .keys()
                .filter(|key| key.sender == sender)
                .cloned()
                .collect();

            for key in &keys {
                if let Some(timer) = state.remove(key) {
                    timer.handle.abort();
                }
            }
            keys
        };

        for key in &stopped {
            self.notify(key, false);
        }

        if !stopped.is_empty() {
            debug!(sender = %sender, count = stopped.len(), "Cleared typing indicators");
        }
        stopped.len()
    }

    pub fn is_typing(&self, sender: &str, recipient: &str) -> bool {
        self.lock().timers.contains_key(&TypingKey::new(sender, recipient))
    }

    /// Senders currently typing toward `recipient`, sorted.
    pub fn typing_toward(&self, recipient: &str) -> Vec<String> {
        let mut senders: Vec<String> = self
            .lock()
            .typing_to
            .get(recipient)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        senders.sort();
        senders
    }

    pub fn active_timers(&self) -> usize {
        self.lock().timers.len()
    }

    /// Cancel all timers without notifying anyone.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        for (_, timer) in state.timers.drain() {
            timer.handle.abort();
        }
        state.typing_to.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TypingState> {
        self.inner.state.lock().expect("typing state lock poisoned")
    }

    fn spawn_expiry(&self, key: TypingKey, generation: u64) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(inner, &key, generation);
        })
    }

    fn notify(&self, key: &TypingKey, is_typing: bool) {
        self.inner
            .registry
            .send_to_user(&key.recipient, ServerFrame::typing(&key.sender, is_typing));
    }
}

/// Timer callback: stop the pair if this timer is still the current one.
fn expire(inner: Weak<TypingInner>, key: &TypingKey, generation: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let tracker = TypingTracker { inner };

    {
        let mut state = tracker.lock();
        let current = state
            .timers
            .get(key)
            .is_some_and(|timer| timer.generation == generation);
        if !current {
            return;
        }
        // Dropping our own handle detaches it; no abort needed.
        state.remove(key);
    }

    debug!(sender = %key.sender, recipient = %key.recipient, "Typing expired");
    tracker.notify(key, false);
}
