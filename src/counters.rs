use std::fmt;

/// Live tallies for one connection. Mutated only while holding the request
/// queue lock, in the same critical section as the queue transition each
/// count describes, so snapshots are never torn.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub cancelled: u64,
    pub timeouts: u64,
    pub queue_jumpers: u64,
    pub last_ping_ms: Option<u64>,
}

impl Counters {
    pub fn snapshot(&self, unsent_queue: usize, sent_queue: usize) -> CountersSnapshot {
        CountersSnapshot {
            sent: self.sent,
            received: self.received,
            errors: self.errors,
            cancelled: self.cancelled,
            timeouts: self.timeouts,
            queue_jumpers: self.queue_jumpers,
            unsent_queue,
            sent_queue,
            last_ping_ms: self.last_ping_ms,
        }
    }
}

/// An immutable point-in-time copy of the connection counters. Safe to hand
/// to callers; never changes after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    /// Requests written to the transport.
    pub sent: u64,
    /// Replies that completed a request normally.
    pub received: u64,
    /// Error replies delivered to their callers.
    pub errors: u64,
    /// Requests failed with a cancellation, by the caller or by a drain.
    pub cancelled: u64,
    /// Requests failed locally because their deadline passed.
    pub timeouts: u64,
    /// Requests admitted ahead of already-queued unsent requests.
    pub queue_jumpers: u64,
    /// Requests queued but not yet written to the transport.
    pub unsent_queue: usize,
    /// Requests written and still awaiting a reply.
    pub sent_queue: usize,
    /// Round-trip time of the most recent ping, if one completed.
    pub last_ping_ms: Option<u64>,
}

impl CountersSnapshot {
    /// Requests written to the transport whose outcome is still pending.
    pub fn outstanding(&self) -> u64 {
        self.sent
            .saturating_sub(self.received + self.errors + self.cancelled + self.timeouts)
    }
}

impl fmt::Display for CountersSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} received={} errors={} cancelled={} timeouts={} queue_jumpers={} \
             unsent_queue={} sent_queue={} last_ping_ms={}",
            self.sent,
            self.received,
            self.errors,
            self.cancelled,
            self.timeouts,
            self.queue_jumpers,
            self.unsent_queue,
            self.sent_queue,
            self.last_ping_ms
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "-".to_string()),
        )
    }
}
