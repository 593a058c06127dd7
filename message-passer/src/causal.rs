//! Vector-clock causal multicast.
//!
//! [`CausalEngine`] owns the local vector clock and the holdback queue.  It
//! is plain synchronous state: the dispatch task is its only caller, so all
//! mutation happens from one place and no locking is needed.
//!
//! A multicast moves through `received -> (ready | held) -> delivered`.
//! Held messages become ready only when the clock advances, so the holdback
//! queue is swept after every delivery until nothing more qualifies.

use {
    crate::{
        error::{MessagePasserError, Result},
        message::Message,
        node::NodeDirectory,
    },
    log::debug,
    std::sync::Arc,
};

/// What happened to one received multicast.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Messages now deliverable, in delivery order.  Besides the received
    /// message itself this includes anything it unblocked in the holdback
    /// queue.
    pub delivered: Vec<Message>,
    /// The message went into the holdback queue.
    pub held: bool,
    /// The message had already been seen and was ignored.
    pub duplicate: bool,
    /// A copy to forward to the rest of the group, for messages that did not
    /// originate here.
    pub relay: Option<Message>,
}

#[derive(Debug)]
pub struct CausalEngine {
    directory: Arc<NodeDirectory>,
    local_index: usize,
    /// `clock[i]` is the highest multicast sequence number from node `i`
    /// delivered here.  `clock[local_index]` counts our own multicasts that
    /// have come back through the loopback.
    clock: Vec<u64>,
    holdback: Vec<Message>,
}

impl CausalEngine {
    pub fn new(directory: Arc<NodeDirectory>, local_name: &str) -> Result<Self> {
        let (local_index, _) = directory.require(local_name)?;
        let clock = vec![0; directory.len()];
        Ok(Self {
            directory,
            local_index,
            clock,
            holdback: Vec::new(),
        })
    }

    pub fn local_index(&self) -> usize {
        self.local_index
    }

    pub fn clock(&self) -> &[u64] {
        &self.clock
    }

    /// Number of our own multicasts delivered back to us.
    pub fn local_delivered(&self) -> u64 {
        self.clock[self.local_index]
    }

    pub fn holdback_len(&self) -> usize {
        self.holdback.len()
    }

    /// Timestamp for a new local multicast with group sequence `seq_num`.
    ///
    /// Every other dimension is a snapshot of the current clock.
    pub fn stamp(&self, seq_num: u64) -> Vec<u64> {
        let mut timestamp = self.clock.clone();
        timestamp[self.local_index] = seq_num;
        timestamp
    }

    /// Process one inbound multicast.
    ///
    /// Returns an error for messages that cannot belong to this session
    /// (unknown source, wrong timestamp length); those are never delivered.
    pub fn receive(&mut self, message: Message) -> Result<Outcome> {
        let source_index = self.validate(&message)?;

        if self.already_received(&message, source_index) {
            debug!(
                "ignoring duplicate multicast {} from {} {:?}",
                message.seq_num, message.source, message.timestamp
            );
            return Ok(Outcome {
                duplicate: true,
                ..Outcome::default()
            });
        }

        let mut outcome = Outcome {
            relay: (source_index != self.local_index).then(|| message.clone()),
            ..Outcome::default()
        };

        if self.is_ready(&message, source_index) {
            self.advance(&message, source_index);
            outcome.delivered.push(message);
            self.sweep_holdback(&mut outcome.delivered);
        } else {
            debug!(
                "holding multicast {} from {} {:?} (clock {:?})",
                message.seq_num, message.source, message.timestamp, self.clock
            );
            self.holdback.push(message);
            outcome.held = true;
        }
        Ok(outcome)
    }

    fn validate(&self, message: &Message) -> Result<usize> {
        let source_index = self
            .directory
            .index_of(&message.source)
            .ok_or_else(|| MessagePasserError::UnknownNode(message.source.clone()))?;
        if message.timestamp.len() != self.clock.len() {
            return Err(MessagePasserError::InvalidTimestamp {
                expected: self.clock.len(),
                actual: message.timestamp.len(),
            });
        }
        Ok(source_index)
    }

    /// Whether `message` is exactly the next one to deliver from its source
    /// with all of its causal dependencies already delivered here.
    pub fn is_ready(&self, message: &Message, source_index: usize) -> bool {
        let next = |i: usize| self.clock[i].saturating_add(1);

        if source_index == self.local_index {
            return message.timestamp[self.local_index] == next(self.local_index);
        }
        message.timestamp.iter().enumerate().all(|(i, &value)| {
            if i == source_index {
                value == next(i)
            } else if i == self.local_index {
                true
            } else {
                value <= self.clock[i]
            }
        })
    }

    /// Whether `message` has been delivered already or is sitting in the
    /// holdback queue.
    pub fn already_received(&self, message: &Message, source_index: usize) -> bool {
        if message.timestamp[source_index] <= self.clock[source_index] {
            return true;
        }
        self.holdback
            .iter()
            .any(|held| held.source == message.source && held.timestamp == message.timestamp)
    }

    fn advance(&mut self, message: &Message, source_index: usize) {
        if source_index == self.local_index {
            self.clock[source_index] = self.clock[source_index].saturating_add(1);
        } else {
            self.clock[source_index] = message.timestamp[source_index];
        }
    }

    /// Deliver held messages until none is ready.
    fn sweep_holdback(&mut self, delivered: &mut Vec<Message>) {
        loop {
            let ready = self.holdback.iter().position(|held| {
                self.directory
                    .index_of(&held.source)
                    .is_some_and(|source_index| self.is_ready(held, source_index))
            });
            let Some(position) = ready else {
                break;
            };
            let message = self.holdback.swap_remove(position);
            if let Some(source_index) = self.directory.index_of(&message.source) {
                self.advance(&message, source_index);
            }
            debug!(
                "releasing held multicast {} from {} {:?}",
                message.seq_num, message.source, message.timestamp
            );
            delivered.push(message);
        }
    }
}
