use crate::channel::{now_millis, Channel};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Membership-based idle tracking for registered channels.
///
/// The processor adds a channel when it is registered and removes it when it
/// is closed. The timer holds identity-keyed membership only; it never
/// closes channels itself and never extends their lifetime beyond the map
/// entry.
pub trait IdleTimer: Send + Sync {
    /// Start tracking a channel.
    fn add(&self, channel: &Arc<Channel>);

    /// Stop tracking a channel.
    fn remove(&self, channel: &Arc<Channel>);
}

/// Default `IdleTimer` keyed by channel id.
#[derive(Debug)]
pub struct IdleMonitor {
    timeout: Duration,
    members: Mutex<HashMap<u64, Arc<Channel>>>,
}

impl IdleMonitor {
    /// Create a monitor that reports channels idle after `timeout`.
    pub fn new(timeout: Duration) -> IdleMonitor {
        IdleMonitor {
            timeout,
            members: Mutex::new(HashMap::new()),
        }
    }

    /// Number of tracked channels.
    pub fn len(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    /// Returns true when no channels are tracked.
    pub fn is_empty(&self) -> bool {
        self.members.lock().unwrap().is_empty()
    }

    /// Snapshot of the tracked channels whose last I/O is older than the
    /// configured timeout.
    pub fn idle_channels(&self) -> Vec<Arc<Channel>> {
        let now = now_millis();
        let timeout_ms = self.timeout.as_millis() as u64;
        self.members
            .lock()
            .unwrap()
            .values()
            .filter(|ch| now.saturating_sub(ch.last_io_time_ms()) >= timeout_ms)
            .cloned()
            .collect()
    }
}

impl IdleTimer for IdleMonitor {
    fn add(&self, channel: &Arc<Channel>) {
        self.members
            .lock()
            .unwrap()
            .insert(channel.id(), channel.clone());
    }

    fn remove(&self, channel: &Arc<Channel>) {
        self.members.lock().unwrap().remove(&channel.id());
    }
}
