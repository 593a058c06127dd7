//! Application-facing handle.
//!
//! [`MessagePasser`] builds the mesh, then spawns a reader task and a writer
//! task per connection, and the dispatcher.  All of them share a
//! [`CancellationToken`] so a single call to
//! [`shutdown`](MessagePasser::shutdown) (or dropping the passer) winds the
//! whole session down.  Writers keep flushing what is already queued for up
//! to `drain_timeout_ms` after that.

use {
    crate::{
        config::{FaultRules, MessagePasserConfig},
        dispatch::{ClockSnapshot, Command, Dispatcher},
        error::{MessagePasserError, Result},
        mesh::MeshConnector,
        message::Message,
        node::{Node, NodeDirectory},
        rules::{Direction, FaultInjector},
        transport,
    },
    log::{info, warn},
    std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    },
    tokio::{
        net::TcpListener,
        sync::{mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
};

/// Cloneable submission handle.
///
/// Sending never fails from the caller's point of view: once the passer has
/// shut down, submissions are logged and discarded.
#[derive(Debug, Clone)]
pub struct MessageSender {
    commands: mpsc::Sender<Command>,
}

impl MessageSender {
    /// Queue a direct message.  A destination of
    /// [`MULTICAST_DESTINATION`](crate::message::MULTICAST_DESTINATION) is
    /// treated as a multicast.
    pub async fn send(&self, message: Message) {
        self.submit(Command::Send(message)).await;
    }

    /// Queue a multicast to the whole group, ourselves included.
    pub async fn multicast(&self, message: Message) {
        self.submit(Command::Multicast(message)).await;
    }

    async fn submit(&self, command: Command) {
        if let Err(e) = self.commands.send(command).await {
            warn!("message passer is shut down, discarding {:?}", e.0);
        }
    }
}

pub struct MessagePasser {
    local_name: String,
    directory: Arc<NodeDirectory>,
    sender: MessageSender,
    delivered: mpsc::Receiver<Message>,
    connections: usize,
    live: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MessagePasser {
    /// Bind the local node's port and join the mesh.
    ///
    /// Returns once a connection to every node, the loopback included, is
    /// up.
    pub async fn init(
        config: MessagePasserConfig,
        nodes: Vec<Node>,
        local_name: &str,
        rules: FaultRules,
    ) -> Result<Self> {
        config.validate()?;
        let directory = NodeDirectory::new(nodes)?;
        let listener = MeshConnector::new(&config, &directory, local_name)?
            .bind()
            .await?;
        Self::start_with_listener(config, directory, local_name, rules, listener).await
    }

    /// Join the mesh using an already bound listener.
    pub async fn start_with_listener(
        config: MessagePasserConfig,
        directory: NodeDirectory,
        local_name: &str,
        rules: FaultRules,
        listener: TcpListener,
    ) -> Result<Self> {
        config.validate()?;
        let mesh = MeshConnector::new(&config, &directory, local_name)?
            .connect(listener)
            .await?;
        let directory = Arc::new(directory);

        let capacity = config.queue_capacity;
        let max_message_size = config.max_message_size;
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (delivered_tx, delivered_rx) = mpsc::channel(capacity);

        let cancel = CancellationToken::new();
        let connections = mesh.len();
        let live = Arc::new(AtomicUsize::new(connections));
        let mut tasks = Vec::with_capacity(connections.saturating_mul(2).saturating_add(1));
        let mut links = transport::Links::new();

        for connection in mesh.connections {
            tasks.push(tokio::spawn(transport::run_link(
                connection.peer.clone(),
                connection.writer,
                links.open(&connection.peer),
                max_message_size,
                config.drain_timeout(),
                cancel.clone(),
            )));
            tasks.push(tokio::spawn(transport::run_reader(
                connection.peer.clone(),
                connection.reader,
                inbound_tx.clone(),
                max_message_size,
                live.clone(),
                cancel.clone(),
            )));
        }
        drop(inbound_tx);

        let dispatcher = Dispatcher::new(
            directory.clone(),
            local_name,
            links,
            FaultInjector::new(Direction::Send, rules.send, capacity),
            FaultInjector::new(Direction::Receive, rules.receive, capacity),
            delivered_tx,
        )?;
        tasks.push(tokio::spawn(dispatcher.run(
            command_rx,
            inbound_rx,
            cancel.clone(),
        )));

        info!("{} message passer running", local_name);
        Ok(Self {
            local_name: local_name.to_string(),
            directory,
            sender: MessageSender {
                commands: command_tx,
            },
            delivered: delivered_rx,
            connections,
            live,
            cancel,
            tasks,
        })
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    /// Connections established at setup, one per node.
    pub fn connection_count(&self) -> usize {
        self.connections
    }

    /// Connections whose reader is still running.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    pub async fn send(&self, message: Message) {
        self.sender.send(message).await;
    }

    pub async fn multicast(&self, message: Message) {
        self.sender.multicast(message).await;
    }

    /// Wait for the next delivered message.  `None` after shutdown, once
    /// everything delivered before it has been handed out.
    pub async fn receive(&mut self) -> Option<Message> {
        self.delivered.recv().await
    }

    /// Take a delivered message if one is already waiting.
    pub fn try_receive(&mut self) -> Option<Message> {
        self.delivered.try_recv().ok()
    }

    pub async fn clock_snapshot(&self) -> Result<ClockSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .commands
            .send(Command::Snapshot(reply_tx))
            .await
            .map_err(|_| MessagePasserError::ChannelClosed)?;
        reply_rx.await.map_err(|_| MessagePasserError::ChannelClosed)
    }

    /// Stop every task and wait for them to exit.  Copies already queued
    /// for a peer are flushed first, within `drain_timeout_ms`.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("{} task failed during shutdown: {}", self.local_name, e);
            }
        }
        info!("{} message passer stopped", self.local_name);
    }
}

/// Cancels the session without waiting.  Writer tasks still flush their
/// queues in the background within `drain_timeout_ms`.
impl Drop for MessagePasser {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
