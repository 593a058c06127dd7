//! Fault-injection rules.
//!
//! Rules are configured once at startup and consulted for every outbound
//! copy and every inbound message.  The first matching rule wins.  A `drop`
//! rule discards the message silently; a `delay` rule parks it in a side
//! queue from which exactly one message is released each time a message
//! passes normally in the same direction.

use {
    crate::message::Message,
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    std::{collections::VecDeque, fmt},
};

/// What to do with a message that matches a rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Discard the message.
    Drop,
    /// Hold the message back until live traffic lets it through.
    Delay,
}

/// A predicate over message fields plus an action.
///
/// Every field left as `None` is a wildcard, so a rule with only an action
/// matches all traffic.  The action itself must always be spelled out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub action: RuleAction,
    #[serde(default)]
    pub source: Option<String>,
    /// Compared with the message's destination field and, on the send path,
    /// also with the peer the copy is written to.
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub seq_num: Option<u64>,
}

impl Rule {
    pub fn new(action: RuleAction) -> Self {
        Self {
            action,
            source: None,
            destination: None,
            kind: None,
            content: None,
            seq_num: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_seq_num(mut self, seq_num: u64) -> Self {
        self.seq_num = Some(seq_num);
        self
    }

    /// Whether this rule applies to `message`, optionally written to `link`.
    pub fn matches(&self, message: &Message, link: Option<&str>) -> bool {
        fn field(expected: &Option<String>, actual: &str) -> bool {
            expected.as_deref().is_none_or(|e| e == actual)
        }

        let destination = self.destination.as_deref().is_none_or(|d| {
            d == message.destination || link.is_some_and(|link| d == link)
        });

        field(&self.source, &message.source)
            && destination
            && field(&self.kind, &message.kind)
            && field(&self.content, &message.content)
            && self.seq_num.is_none_or(|s| s == message.seq_num)
    }
}

/// Ordered rule list; first match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn first_match(&self, message: &Message, link: Option<&str>) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(message, link))
    }
}

/// The two paths a rule set can guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// Anything a [`FaultInjector`] can inspect.
pub trait Inspect {
    fn message(&self) -> &Message;

    /// The peer this item is being written to, when that differs from the
    /// message's own destination field.
    fn link(&self) -> Option<&str> {
        None
    }
}

impl Inspect for Message {
    fn message(&self) -> &Message {
        self
    }
}

/// Result of running an item through a [`FaultInjector`].
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    /// No rule matched; process the item normally.
    Pass(T),
    /// Parked in the delayed queue.
    Delayed,
    /// Discarded.
    Dropped,
}

/// Applies a [`RuleSet`] to one direction of traffic and owns that
/// direction's delayed queue.
#[derive(Debug)]
pub struct FaultInjector<T> {
    direction: Direction,
    rules: RuleSet,
    delayed: VecDeque<T>,
    capacity: usize,
}

impl<T: Inspect> FaultInjector<T> {
    pub fn new(direction: Direction, rules: RuleSet, capacity: usize) -> Self {
        Self {
            direction,
            rules,
            delayed: VecDeque::new(),
            capacity,
        }
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    /// Match `item` against the rules.
    pub fn admit(&mut self, item: T) -> Admission<T> {
        let action = match self.rules.first_match(item.message(), item.link()) {
            None => return Admission::Pass(item),
            Some(rule) => rule.action,
        };
        match action {
            RuleAction::Delay if self.delayed.len() < self.capacity => {
                debug!(
                    "{} rule delaying {} from {} ({} parked)",
                    self.direction,
                    item.message().kind,
                    item.message().source,
                    self.delayed.len().saturating_add(1)
                );
                self.delayed.push_back(item);
                Admission::Delayed
            }
            RuleAction::Delay => {
                warn!(
                    "{} delayed queue full ({}), dropping {} from {}",
                    self.direction,
                    self.capacity,
                    item.message().kind,
                    item.message().source
                );
                Admission::Dropped
            }
            RuleAction::Drop => {
                debug!(
                    "{} rule dropping {} from {} to {}",
                    self.direction,
                    item.message().kind,
                    item.message().source,
                    item.link().unwrap_or(&item.message().destination)
                );
                Admission::Dropped
            }
        }
    }

    /// Release one parked item.  Call once after each item that passed
    /// [`admit`](Self::admit) has been processed.
    pub fn release_one(&mut self) -> Option<T> {
        let item = self.delayed.pop_front()?;
        debug!(
            "{} releasing delayed {} from {}",
            self.direction,
            item.message().kind,
            item.message().source
        );
        Some(item)
    }
}
