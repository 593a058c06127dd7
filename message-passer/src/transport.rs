//! Framed I/O over mesh connections.
//!
//! ## Wire format
//!
//! Every frame on the wire is length-prefixed:
//!
//! ```text
//! [4 bytes: payload length (u32-le)] [N bytes: bincode payload]
//! ```
//!
//! A reader validates the length against `max_message_size` before reading
//! the payload.  A payload that fails to decode is skipped: the length
//! prefix already tells us where the next frame starts, so the stream stays
//! in sync.
//!
//! Each connection gets one reader task that forwards decoded messages to
//! the dispatcher, and one writer task that owns the write half and drains
//! that peer's queue in [`Links`].

use {
    crate::{
        error::{MessagePasserError, Result},
        message::{Frame, Message},
        rules::Inspect,
    },
    log::{debug, info, warn},
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        sync::mpsc,
    },
    tokio_util::sync::CancellationToken,
};

/// A received message together with the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Name of the peer at the other end of the connection.
    pub from: String,
    pub message: Message,
}

/// One copy of a message bound for one peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub peer: String,
    pub message: Message,
}

impl Inspect for Outgoing {
    fn message(&self) -> &Message {
        &self.message
    }

    fn link(&self) -> Option<&str> {
        Some(&self.peer)
    }
}

/// Result of reading one frame.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// The frame was well delimited but its payload did not decode.
    Malformed(MessagePasserError),
    /// The peer closed the stream between frames.
    Closed,
}

/// Read one length-prefixed frame.
///
/// Errors are fatal for the stream: I/O failures, a stream cut mid-frame,
/// or a length prefix above `max_message_size`.
pub async fn read_frame<R>(reader: &mut R, max_message_size: usize) -> Result<ReadOutcome>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(ReadOutcome::Closed);
        }
        return Err(e.into());
    }

    let len = Frame::read_frame_len(&header);
    if len > max_message_size {
        return Err(MessagePasserError::MessageTooLarge {
            size: len,
            max: max_message_size,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(match Frame::deserialize(&payload) {
        Ok(frame) => ReadOutcome::Frame(frame),
        Err(e) => ReadOutcome::Malformed(e),
    })
}

/// Write one framed message and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, max_message_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.serialize_framed(max_message_size)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read frames from `peer` until the stream ends, forwarding messages to
/// `inbound`.
///
/// `live` is decremented when the task exits; no reconnection is attempted.
pub async fn run_reader<R>(
    peer: String,
    mut reader: R,
    inbound: mpsc::Sender<Inbound>,
    max_message_size: usize,
    live: Arc<AtomicUsize>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = read_frame(&mut reader, max_message_size) => outcome,
        };
        match outcome {
            Ok(ReadOutcome::Frame(Frame::Data(message))) => {
                debug!("received {} from {}", message.kind, peer);
                let inbound_message = Inbound {
                    from: peer.clone(),
                    message,
                };
                if inbound.send(inbound_message).await.is_err() {
                    debug!("inbound channel closed, stopping reader for {}", peer);
                    break;
                }
            }
            Ok(ReadOutcome::Frame(Frame::Hello { name })) => {
                warn!("ignoring repeated hello from {} (claims {})", peer, name);
            }
            Ok(ReadOutcome::Malformed(e)) => {
                warn!("malformed frame from {}: {}", peer, e);
            }
            Ok(ReadOutcome::Closed) => {
                info!("lost connection to {}", peer);
                break;
            }
            Err(e) => {
                warn!("read error from {}: {}, closing connection", peer, e);
                break;
            }
        }
    }
    live.fetch_sub(1, Ordering::SeqCst);
}

/// Per-peer outbound queues, one per writer task.
///
/// Queueing never waits: a peer that stops reading only grows its own
/// backlog, and never stalls the dispatcher or writes to other peers.
#[derive(Debug, Default)]
pub struct Links {
    queues: HashMap<String, mpsc::UnboundedSender<Message>>,
}

impl Links {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` and return the receiving end for its writer task.
    pub fn open(&mut self, peer: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues.insert(peer.to_string(), tx);
        rx
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queue one copy for its peer.  Returns false if the peer has no link
    /// or its writer has stopped; a stopped link is forgotten.
    pub fn push(&mut self, outgoing: Outgoing) -> bool {
        let Outgoing { peer, message } = outgoing;
        let Some(queue) = self.queues.get(&peer) else {
            warn!("no connection to {}, dropping {}", peer, message.kind);
            return false;
        };
        if let Err(e) = queue.send(message) {
            warn!("link to {} is closed, dropping {}", peer, e.0.kind);
            self.queues.remove(&peer);
            return false;
        }
        true
    }
}

/// Write every message queued for `peer` until the queue closes or a write
/// fails.
///
/// Once `cancel` fires the link keeps flushing whatever is already queued,
/// for at most `drain_timeout`, then stops even if a write is stuck.
pub async fn run_link<W>(
    peer: String,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Message>,
    max_message_size: usize,
    drain_timeout: Duration,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let writing = async {
        loop {
            let message = tokio::select! {
                biased;
                message = queue.recv() => message,
                _ = cancel.cancelled() => break,
            };
            let Some(message) = message else {
                debug!("link to {} closed", peer);
                break;
            };
            if !write_message(&peer, &mut writer, message, max_message_size).await {
                break;
            }
        }
    };
    let deadline = async {
        cancel.cancelled().await;
        tokio::time::sleep(drain_timeout).await;
    };

    let flushed = tokio::select! {
        _ = writing => true,
        _ = deadline => false,
    };
    if !flushed {
        warn!(
            "gave up flushing {} after {:?}, queued messages are lost",
            peer, drain_timeout
        );
    }
}

/// Returns false when the link should be closed.
async fn write_message<W>(
    peer: &str,
    writer: &mut W,
    message: Message,
    max_message_size: usize,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    let kind = message.kind.clone();
    match write_frame(writer, &Frame::Data(message), max_message_size).await {
        Ok(()) => {
            debug!("sent {} to {}", kind, peer);
            true
        }
        Err(e @ MessagePasserError::MessageTooLarge { .. }) => {
            warn!("not sending {} to {}: {}", kind, peer, e);
            true
        }
        Err(e) => {
            warn!("write to {} failed: {}, closing link", peer, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        tokio::io::{duplex, DuplexStream},
    };

    const MAX_FRAME: usize = 1_048_576;

    fn message(kind: &str, content: &str) -> Message {
        Message {
            source: "a".into(),
            destination: "b".into(),
            kind: kind.into(),
            content: content.into(),
            ..Message::default()
        }
    }

    async fn next_data(reader: &mut DuplexStream) -> Message {
        match tokio::time::timeout(Duration::from_secs(2), read_frame(reader, MAX_FRAME))
            .await
            .expect("timeout waiting for frame")
            .unwrap()
        {
            ReadOutcome::Frame(Frame::Data(message)) => message,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_stream() {
        let (mut client, mut server) = duplex(4096);
        let frame = Frame::Hello { name: "armin".into() };
        write_frame(&mut client, &frame, MAX_FRAME).await.unwrap();
        match read_frame(&mut server, MAX_FRAME).await.unwrap() {
            ReadOutcome::Frame(decoded) => assert_eq!(decoded, frame),
            other => panic!("unexpected {other:?}"),
        }
        drop(client);
        assert!(matches!(
            read_frame(&mut server, MAX_FRAME).await.unwrap(),
            ReadOutcome::Closed
        ));
    }

    #[tokio::test]
    async fn test_malformed_payload_keeps_stream_in_sync() {
        let (mut client, mut server) = duplex(4096);
        client.write_all(&3u32.to_le_bytes()).await.unwrap();
        client.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
        write_frame(&mut client, &Frame::Data(message("k", "after")), MAX_FRAME)
            .await
            .unwrap();

        assert!(matches!(
            read_frame(&mut server, MAX_FRAME).await.unwrap(),
            ReadOutcome::Malformed(_)
        ));
        assert_eq!(next_data(&mut server).await.content, "after");
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (mut client, mut server) = duplex(4096);
        client.write_all(&1_000u32.to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut server, 10).await,
            Err(MessagePasserError::MessageTooLarge { size: 1_000, max: 10 })
        ));
    }

    #[tokio::test]
    async fn test_reader_forwards_and_stops_on_eof() {
        let (mut client, server) = duplex(4096);
        let (tx, mut rx) = mpsc::channel(8);
        let live = Arc::new(AtomicUsize::new(1));
        let task = tokio::spawn(run_reader(
            "a".to_string(),
            server,
            tx,
            MAX_FRAME,
            live.clone(),
            CancellationToken::new(),
        ));

        write_frame(&mut client, &Frame::Data(message("k", "1")), MAX_FRAME)
            .await
            .unwrap();
        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.from, "a");
        assert_eq!(inbound.message.content, "1");

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("reader did not stop")
            .unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_link_writes_in_queue_order() {
        let (client, mut server) = duplex(4096);
        let mut links = Links::new();
        let queue = links.open("b");
        tokio::spawn(run_link(
            "b".to_string(),
            client,
            queue,
            MAX_FRAME,
            Duration::from_secs(1),
            CancellationToken::new(),
        ));

        for content in ["1", "2", "3"] {
            assert!(links.push(Outgoing {
                peer: "b".into(),
                message: message("k", content),
            }));
        }
        for content in ["1", "2", "3"] {
            assert_eq!(next_data(&mut server).await.content, content);
        }
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_others() {
        // a tiny pipe nobody reads from fills up after the first frame
        let (stalled, _unread) = duplex(64);
        let (healthy, mut server) = duplex(65_536);
        let cancel = CancellationToken::new();
        let mut links = Links::new();
        for (peer, writer) in [("slow", stalled), ("fast", healthy)] {
            tokio::spawn(run_link(
                peer.to_string(),
                writer,
                links.open(peer),
                MAX_FRAME,
                Duration::from_millis(50),
                cancel.clone(),
            ));
        }

        let payload = "x".repeat(200);
        for _ in 0..50 {
            for peer in ["slow", "fast"] {
                assert!(links.push(Outgoing {
                    peer: peer.into(),
                    message: message("k", &payload),
                }));
            }
        }
        for _ in 0..50 {
            assert_eq!(next_data(&mut server).await.content, payload);
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancelled_link_flushes_queue() {
        let (client, mut server) = duplex(65_536);
        let mut links = Links::new();
        let queue = links.open("b");
        for i in 0..20 {
            links.push(Outgoing {
                peer: "b".into(),
                message: message("k", &i.to_string()),
            });
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        drop(links);

        run_link(
            "b".to_string(),
            client,
            queue,
            MAX_FRAME,
            Duration::from_secs(1),
            cancel,
        )
        .await;
        for i in 0..20 {
            assert_eq!(next_data(&mut server).await.content, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_push_to_unknown_or_closed_link() {
        let mut links = Links::new();
        let queue = links.open("b");
        assert!(!links.push(Outgoing {
            peer: "z".into(),
            message: message("k", "nowhere"),
        }));
        drop(queue);
        assert!(!links.push(Outgoing {
            peer: "b".into(),
            message: message("k", "gone"),
        }));
        assert!(links.is_empty());
    }
}
