//! Reconnect scheduling
//!
//! After an unexpected close the link is retried once per backoff period.
//! Only one attempt may be outstanding; a newer schedule or an explicit
//! close invalidates older timers through a generation counter.

use std::time::Duration;

/// Default delay before a reconnect attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Ticket for one scheduled reconnect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectTicket {
    /// Generation the ticket was issued in
    pub generation: u64,
    /// How long to wait before attempting
    pub delay: Duration,
}

/// Tracks whether a reconnect is pending
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    enabled: bool,
    delay: Duration,
    generation: u64,
    pending: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(true, DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Create a policy
    pub fn new(enabled: bool, delay: Duration) -> Self {
        Self {
            enabled,
            delay,
            generation: 0,
            pending: false,
        }
    }

    /// Is auto-reconnect turned on
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turn auto-reconnect on or off. Turning it off voids any pending attempt.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.cancel();
        }
    }

    /// Is an attempt currently scheduled
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Request an attempt. Returns `None` if disabled or one is already pending.
    pub fn schedule(&mut self) -> Option<ReconnectTicket> {
        if !self.enabled || self.pending {
            return None;
        }
        self.pending = true;
        self.generation += 1;
        Some(ReconnectTicket {
            generation: self.generation,
            delay: self.delay,
        })
    }

    /// Called when a ticket's timer fires. Returns true if the attempt should run.
    pub fn fire(&mut self, ticket: ReconnectTicket) -> bool {
        if !self.pending || ticket.generation != self.generation {
            return false;
        }
        self.pending = false;
        true
    }

    /// Void any pending attempt
    pub fn cancel(&mut self) {
        if self.pending {
            self.pending = false;
            self.generation += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_attempts_suppressed() {
        let mut policy = ReconnectPolicy::default();
        let ticket = policy.schedule().unwrap();
        assert_eq!(ticket.delay, Duration::from_secs(5));
        assert!(policy.schedule().is_none());

        assert!(policy.fire(ticket));
        assert!(!policy.fire(ticket));
        assert!(policy.schedule().is_some());
    }

    #[test]
    fn test_cancel_voids_ticket() {
        let mut policy = ReconnectPolicy::default();
        let ticket = policy.schedule().unwrap();
        policy.cancel();
        assert!(!policy.fire(ticket));
        assert!(!policy.is_pending());
    }

    #[test]
    fn test_disabled_never_schedules() {
        let mut policy = ReconnectPolicy::new(false, Duration::from_millis(10));
        assert!(policy.schedule().is_none());
        policy.set_enabled(true);
        assert!(policy.schedule().is_some());
        policy.set_enabled(false);
        assert!(!policy.is_pending());
    }
}
