//! Periodic retransmission and teardown sweep.
//!
//! Each tick visits every live connection exactly once: expired segments are
//! re-sent verbatim, then a connection whose teardown conditions all hold
//! (or which aborted) is destroyed. The sweep walks a snapshot of handles,
//! so destroying a connection mid-sweep cannot skip or revisit another.

use std::time::{Duration, Instant};

use crate::config::Config;
use crate::connection::Lifecycle;
use crate::registry::{ConnectionId, Registry};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Connections examined.
    pub visited: usize,
    /// Segments re-sent across all connections.
    pub retransmitted: usize,
    /// Connections destroyed.
    pub reaped: Vec<Reaped>,
}

impl TickReport {
    /// Handles of the destroyed connections, in sweep order.
    pub fn reaped_ids(&self) -> Vec<ConnectionId> {
        self.reaped.iter().map(|r| r.id).collect()
    }
}

/// Final state of a connection destroyed by a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub id: ConnectionId,
    /// `Terminated` for a clean teardown, `Aborted` otherwise.
    pub lifecycle: Lifecycle,
    /// The cumulative ack the connection last sent.
    pub recv_next: u32,
}

/// Drives retransmission and teardown for a whole registry.
#[derive(Debug, Clone)]
pub struct Scheduler {
    period: Duration,
}

impl Scheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.tick_interval())
    }

    /// How often [`tick`](Self::tick) should run.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run one sweep at time `now`.
    pub fn tick(&self, registry: &mut Registry, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        for id in registry.ids() {
            let Some(connection) = registry.get_mut(id) else {
                continue;
            };
            report.visited += 1;
            report.retransmitted += connection.retransmit_expired(now);

            if !connection.should_reap() {
                continue;
            }
            let reaped = Reaped {
                id,
                lifecycle: connection.lifecycle(),
                recv_next: connection.recv_next(),
            };
            if registry.destroy(id).is_ok() {
                report.reaped.push(reaped);
            }
        }

        if report.retransmitted > 0 || !report.reaped.is_empty() {
            tracing::debug!(
                visited = report.visited,
                retransmitted = report.retransmitted,
                reaped = report.reaped.len(),
                "scheduler tick"
            );
        }
        report
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::transport::memory::{Datagrams, MemoryChannel, MemoryStream, MemoryStreamHandle};

    fn register(registry: &mut Registry) -> (ConnectionId, Datagrams, MemoryStreamHandle) {
        let (channel, wire) = MemoryChannel::with_queue();
        let (stream, app) = MemoryStream::unbounded();
        let connection = Connection::new(
            &Config::new(4, 100),
            Box::new(channel),
            Box::new(stream),
        );
        (registry.insert(connection), wire, app)
    }

    #[test]
    fn period_from_config() {
        let scheduler = Scheduler::from_config(&Config::new(1, 500));
        assert_eq!(scheduler.period(), Duration::from_millis(100));
        assert_eq!(Scheduler::new(Duration::ZERO).period(), Duration::from_millis(1));
    }

    #[test]
    fn tick_retransmits_only_expired() {
        let t0 = Instant::now();
        let mut registry = Registry::new();
        let (id, wire, app) = register(&mut registry);
        app.push_input(b"abc");
        registry.get_mut(id).unwrap().on_readable(t0);
        let original = wire.pop().unwrap();

        let scheduler = Scheduler::new(Duration::from_millis(20));
        let report = scheduler.tick(&mut registry, t0 + Duration::from_millis(50));
        assert_eq!(report.retransmitted, 0);
        assert!(wire.is_empty());

        let report = scheduler.tick(&mut registry, t0 + Duration::from_millis(100));
        assert_eq!(report.visited, 1);
        assert_eq!(report.retransmitted, 1);
        assert_eq!(wire.pop().unwrap(), original);
    }

    #[test]
    fn reaping_mid_sweep_visits_everyone() {
        let now = Instant::now();
        let mut registry = Registry::new();
        let handles: Vec<_> = (0..5).map(|_| register(&mut registry)).collect();

        // Abort the second and fourth connections so they are reaped mid-sweep.
        for (id, _, app) in [&handles[1], &handles[3]] {
            app.fail_writes(true);
            registry
                .get_mut(*id)
                .unwrap()
                .on_segment(1, bytes::Bytes::from_static(b"x"), now);
        }

        let report = Scheduler::default().tick(&mut registry, now);
        assert_eq!(report.visited, 5);
        assert_eq!(report.reaped_ids(), vec![handles[1].0, handles[3].0]);
        assert!(report.reaped.iter().all(|r| r.lifecycle == Lifecycle::Aborted));
        assert_eq!(registry.len(), 3);

        let report = Scheduler::default().tick(&mut registry, now);
        assert_eq!(report.visited, 3);
        assert!(report.reaped.is_empty());
    }
}
