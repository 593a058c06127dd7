//! Full-mesh connection bootstrap.
//!
//! Symmetry is broken by name order: a node listens for every peer whose
//! name sorts before its own and dials every peer whose name sorts after
//! it, so each pair ends up with exactly one connection no matter which side
//! starts first.  A node also dials itself; that connection is the loopback
//! through which its own multicasts are delivered back to it.
//!
//! Setup runs the accept phase and the dial phase concurrently and returns
//! only when both are done.

use {
    crate::{
        config::MessagePasserConfig,
        error::{MessagePasserError, Result},
        message::Frame,
        node::{Node, NodeDirectory},
        transport::{self, ReadOutcome},
    },
    log::{debug, info},
    std::collections::{HashMap, HashSet},
    tokio::net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

/// A live link to one peer.
///
/// For the loopback, `reader` is the accepted end and `writer` the dialed
/// end of the self connection.
#[derive(Debug)]
pub struct Connection {
    pub peer: String,
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
}

/// Every connection of a completed mesh, one per directory entry.
#[derive(Debug)]
pub struct Mesh {
    pub connections: Vec<Connection>,
}

impl Mesh {
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.connections.iter().map(|c| c.peer.as_str())
    }
}

pub struct MeshConnector<'a> {
    config: &'a MessagePasserConfig,
    directory: &'a NodeDirectory,
    local: &'a Node,
}

impl<'a> MeshConnector<'a> {
    pub fn new(
        config: &'a MessagePasserConfig,
        directory: &'a NodeDirectory,
        local_name: &str,
    ) -> Result<Self> {
        let (_, local) = directory.require(local_name)?;
        Ok(Self {
            config,
            directory,
            local,
        })
    }

    /// Bind the listener at `listen_host` and the local node's port.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener =
            TcpListener::bind((self.config.listen_host.as_str(), self.local.port)).await?;
        Ok(listener)
    }

    /// Connect to every node in the directory.
    ///
    /// Fails if a handshake cannot be decoded, if an unexpected peer
    /// connects, or if a peer stays unreachable for `max_dial_attempts`.
    pub async fn connect(self, listener: TcpListener) -> Result<Mesh> {
        let (front, latter) = self.directory.partition(&self.local.name);
        let mut expected: HashSet<String> = front.iter().map(|n| n.name.clone()).collect();
        expected.insert(self.local.name.clone());

        info!(
            "{} joining mesh of {} on {}: accepting {}, dialing {}",
            self.local.name,
            self.directory.len(),
            listener.local_addr()?,
            expected.len(),
            latter.len()
        );

        let (mut accepted, mut dialed) =
            tokio::try_join!(self.accept_all(&listener, expected), self.dial_all(&latter))?;

        let mut connections = Vec::with_capacity(self.directory.len());
        for node in self.directory.iter() {
            let connection = if node.name == self.local.name {
                let (reader, _) = take(&mut accepted, &node.name)?.into_split();
                let (_, writer) = take(&mut dialed, &node.name)?.into_split();
                Connection {
                    peer: node.name.clone(),
                    reader,
                    writer,
                }
            } else {
                let stream = match accepted.remove(&node.name) {
                    Some(stream) => stream,
                    None => take(&mut dialed, &node.name)?,
                };
                let (reader, writer) = stream.into_split();
                Connection {
                    peer: node.name.clone(),
                    reader,
                    writer,
                }
            };
            connections.push(connection);
        }

        info!(
            "{} mesh complete with {} connections",
            self.local.name,
            connections.len()
        );
        Ok(Mesh { connections })
    }

    /// Accept until every name in `pending` has said hello.
    async fn accept_all(
        &self,
        listener: &TcpListener,
        mut pending: HashSet<String>,
    ) -> Result<HashMap<String, TcpStream>> {
        let mut accepted = HashMap::with_capacity(pending.len());
        while !pending.is_empty() {
            let (mut stream, addr) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let name = self.read_hello(&mut stream).await?;
            if !pending.remove(&name) {
                return Err(MessagePasserError::UnexpectedPeer(name));
            }
            debug!(
                "{} accepted {} from {} ({} still pending)",
                self.local.name,
                name,
                addr,
                pending.len()
            );
            accepted.insert(name, stream);
        }
        Ok(accepted)
    }

    async fn read_hello(&self, stream: &mut TcpStream) -> Result<String> {
        let read = transport::read_frame(stream, self.config.max_message_size);
        let outcome = tokio::time::timeout(self.config.handshake_timeout(), read)
            .await
            .map_err(|_| MessagePasserError::Handshake("timed out waiting for hello".into()))?
            .map_err(|e| MessagePasserError::Handshake(e.to_string()))?;
        match outcome {
            ReadOutcome::Frame(Frame::Hello { name }) => Ok(name),
            ReadOutcome::Frame(frame) => Err(MessagePasserError::Handshake(format!(
                "expected hello, got {}",
                frame.tag()
            ))),
            ReadOutcome::Malformed(e) => Err(MessagePasserError::Handshake(e.to_string())),
            ReadOutcome::Closed => Err(MessagePasserError::Handshake(
                "connection closed before hello".into(),
            )),
        }
    }

    /// Dial each node in turn and introduce ourselves.
    async fn dial_all(&self, nodes: &[&Node]) -> Result<HashMap<String, TcpStream>> {
        let mut dialed = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let mut stream = self.dial(node).await?;
            let hello = Frame::Hello {
                name: self.local.name.clone(),
            };
            transport::write_frame(&mut stream, &hello, self.config.max_message_size).await?;
            debug!("{} connected to {}", self.local.name, node);
            dialed.insert(node.name.clone(), stream);
        }
        Ok(dialed)
    }

    /// Dial `node`, retrying at a fixed interval while it is not listening.
    async fn dial(&self, node: &Node) -> Result<TcpStream> {
        let endpoint = node.endpoint();
        let mut attempts = 0u32;
        loop {
            attempts = attempts.saturating_add(1);
            match TcpStream::connect(endpoint.as_str()).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => {
                    if self
                        .config
                        .max_dial_attempts
                        .is_some_and(|max| attempts >= max)
                    {
                        return Err(MessagePasserError::DialExhausted {
                            name: node.name.clone(),
                            attempts,
                        });
                    }
                    debug!(
                        "{} not reachable yet ({}), retry {} in {:?}",
                        node,
                        e,
                        attempts,
                        self.config.dial_retry_interval()
                    );
                    tokio::time::sleep(self.config.dial_retry_interval()).await;
                }
            }
        }
    }
}

fn take(streams: &mut HashMap<String, TcpStream>, name: &str) -> Result<TcpStream> {
    streams
        .remove(name)
        .ok_or_else(|| MessagePasserError::Handshake(format!("no connection for {name}")))
}
