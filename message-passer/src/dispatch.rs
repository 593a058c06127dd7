//! The dispatch task: sole owner of the causal-delivery state.
//!
//! Reader tasks, the application handle and the diagnostics call all talk
//! to the [`Dispatcher`] through channels.  Vector clock, holdback queue,
//! sequence counters and both delayed queues are only ever touched from its
//! run loop, so concurrent peers cannot race on them.
//!
//! Outbound copies go to per-peer [`Links`] without waiting, so the loop
//! never blocks on the network.  The only thing it waits for is the
//! application taking delivered messages.

use {
    crate::{
        causal::CausalEngine,
        error::{MessagePasserError, Result},
        message::{Message, MULTICAST_DESTINATION},
        node::NodeDirectory,
        rules::{Admission, FaultInjector},
        transport::{Inbound, Links, Outgoing},
        unicast::SequenceCounters,
    },
    log::{debug, info, warn},
    std::sync::Arc,
    tokio::sync::{mpsc, oneshot},
    tokio_util::sync::CancellationToken,
};

/// Requests from the application side.
#[derive(Debug)]
pub enum Command {
    Send(Message),
    Multicast(Message),
    Snapshot(oneshot::Sender<ClockSnapshot>),
}

/// Point-in-time view of the dispatcher's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSnapshot {
    pub clock: Vec<u64>,
    pub local_delivered: u64,
    pub holdback: usize,
    pub delayed_inbound: usize,
    pub delayed_outbound: usize,
}

pub struct Dispatcher {
    local_name: String,
    directory: Arc<NodeDirectory>,
    engine: CausalEngine,
    sequences: SequenceCounters,
    links: Links,
    send_faults: FaultInjector<Outgoing>,
    receive_faults: FaultInjector<Message>,
    delivered: mpsc::Sender<Message>,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<NodeDirectory>,
        local_name: &str,
        links: Links,
        send_faults: FaultInjector<Outgoing>,
        receive_faults: FaultInjector<Message>,
        delivered: mpsc::Sender<Message>,
    ) -> Result<Self> {
        let engine = CausalEngine::new(directory.clone(), local_name)?;
        Ok(Self {
            local_name: local_name.to_string(),
            directory,
            engine,
            sequences: SequenceCounters::new(),
            links,
            send_faults,
            receive_faults,
            delivered,
        })
    }

    /// Serve commands and inbound messages until cancelled or until every
    /// producer is gone.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::Receiver<Inbound>,
        cancel: CancellationToken,
    ) {
        let mut inbound_open = true;
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => break,
                },
                message = inbound.recv(), if inbound_open => match message {
                    Some(message) => Step::Inbound(message),
                    None => Step::InboundClosed,
                },
            };
            let handled = tokio::select! {
                _ = cancel.cancelled() => break,
                handled = self.step(step) => handled,
            };
            match handled {
                Ok(true) => {}
                Ok(false) => inbound_open = false,
                Err(e) => {
                    info!("{} dispatcher stopping: {}", self.local_name, e);
                    break;
                }
            }
        }
        debug!(
            "{} dispatcher exited with clock {:?}",
            self.local_name,
            self.engine.clock()
        );
    }

    /// Returns `Ok(false)` once the inbound side has closed.
    async fn step(&mut self, step: Step) -> Result<bool> {
        match step {
            Step::Command(Command::Send(message)) => self.send(message),
            Step::Command(Command::Multicast(message)) => self.multicast(message),
            Step::Command(Command::Snapshot(reply)) => {
                let _ = reply.send(self.snapshot());
            }
            Step::Inbound(inbound) => self.admit_inbound(inbound).await?,
            Step::InboundClosed => {
                info!("{} has no live connections left", self.local_name);
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            clock: self.engine.clock().to_vec(),
            local_delivered: self.engine.local_delivered(),
            holdback: self.engine.holdback_len(),
            delayed_inbound: self.receive_faults.delayed_len(),
            delayed_outbound: self.send_faults.delayed_len(),
        }
    }

    /// Stamp and queue a direct message.  Multicast destinations are
    /// redirected to [`multicast`](Self::multicast).
    pub fn send(&mut self, mut message: Message) {
        if message.is_empty() {
            warn!("empty message, it is dropped");
            return;
        }
        if message.is_multicast() {
            return self.multicast(message);
        }
        if !self.directory.contains(&message.destination) {
            warn!(
                "destination {} is not found, dropping {}",
                message.destination, message.kind
            );
            return;
        }
        message.source = self.local_name.clone();
        message.seq_num = self.sequences.next(&message.destination);
        message.timestamp.clear();
        let peer = message.destination.clone();
        self.enqueue(Outgoing { peer, message });
    }

    /// Stamp a new local multicast and queue it for every node, ourselves
    /// included.
    pub fn multicast(&mut self, mut message: Message) {
        if message.is_empty() {
            warn!("empty message, it is dropped");
            return;
        }
        message.source = self.local_name.clone();
        message.destination = MULTICAST_DESTINATION.to_string();
        message.seq_num = self.sequences.next(MULTICAST_DESTINATION);
        message.timestamp = self.engine.stamp(message.seq_num);
        debug!(
            "{} multicasting {} #{} {:?}",
            self.local_name, message.kind, message.seq_num, message.timestamp
        );
        self.fan_out(&message, &[]);
    }

    /// Run an inbound message through the receive-side rules.
    pub async fn admit_inbound(&mut self, inbound: Inbound) -> Result<()> {
        let Inbound { from, message } = inbound;
        debug!("{} got {} from link {}", self.local_name, message.kind, from);
        match self.receive_faults.admit(message) {
            Admission::Pass(message) => {
                self.deliver(message).await?;
                if let Some(delayed) = self.receive_faults.release_one() {
                    self.deliver(delayed).await?;
                }
            }
            Admission::Delayed | Admission::Dropped => {}
        }
        Ok(())
    }

    async fn deliver(&mut self, message: Message) -> Result<()> {
        if !message.is_multicast() {
            if message.destination != self.local_name {
                warn!(
                    "{} dropping {} addressed to {}",
                    self.local_name, message.kind, message.destination
                );
                return Ok(());
            }
            return self.push_delivered(message).await;
        }

        let outcome = match self.engine.receive(message) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{} dropping multicast: {}", self.local_name, e);
                return Ok(());
            }
        };
        if let Some(relay) = outcome.relay {
            let origin = relay.source.clone();
            self.fan_out(&relay, &[origin.as_str()]);
        }
        for message in outcome.delivered {
            self.push_delivered(message).await?;
        }
        Ok(())
    }

    async fn push_delivered(&self, message: Message) -> Result<()> {
        self.delivered
            .send(message)
            .await
            .map_err(|_| MessagePasserError::ChannelClosed)
    }

    /// Queue one copy of `message` per node.  Relays skip the local node
    /// and everyone in `skip`.
    fn fan_out(&mut self, message: &Message, skip: &[&str]) {
        let relaying = message.source != self.local_name;
        let peers: Vec<String> = self
            .directory
            .names()
            .filter(|name| !skip.contains(name) && !(relaying && *name == self.local_name))
            .map(str::to_string)
            .collect();
        for peer in peers {
            self.enqueue(Outgoing {
                peer,
                message: message.clone(),
            });
        }
    }

    /// Apply the send-side rules and hand the copy to its link.  A delayed
    /// copy is released once a passing copy has been queued.
    fn enqueue(&mut self, outgoing: Outgoing) {
        let Admission::Pass(outgoing) = self.send_faults.admit(outgoing) else {
            return;
        };
        if self.links.push(outgoing) {
            if let Some(delayed) = self.send_faults.release_one() {
                self.links.push(delayed);
            }
        }
    }
}

enum Step {
    Command(Command),
    Inbound(Inbound),
    InboundClosed,
}
