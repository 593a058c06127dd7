//! Per-destination sequence numbering.
//!
//! Direct messages get no holdback: the receiver delivers them as they
//! arrive.  Their sequence numbers only record submission order per
//! destination.  The multicast group counter shares the table under
//! [`MULTICAST_DESTINATION`](crate::message::MULTICAST_DESTINATION).

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct SequenceCounters {
    last: HashMap<String, u64>,
}

impl SequenceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence number for `destination`, starting at 1.
    pub fn next(&mut self, destination: &str) -> u64 {
        let counter = self.last.entry(destination.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// The most recently assigned number, 0 if none.
    pub fn last(&self, destination: &str) -> u64 {
        self.last.get(destination).copied().unwrap_or(0)
    }
}
