//! Cluster bus transport: TCP links carrying encoded frames.
//!
//! Link tasks never touch the cluster view. Readers decode frames and hand
//! them to the coordinator as [`LinkEvent`]s; writers drain a channel of
//! already-encoded frames. Frames are delimited by the 8-byte prefix
//! (signature + total length) that every bus message starts with.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use cinder_cluster::{frame_length, LinkId, Message, PREFIX_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Frames queued per link before new ones are dropped.
pub const LINK_QUEUE_DEPTH: usize = 1024;

/// Something that happened on the bus, delivered to the coordinator.
#[derive(Debug)]
pub enum LinkEvent {
    /// A peer connected to our bus port.
    Accepted { stream: TcpStream, peer: SocketAddr },
    /// A complete, validated frame arrived on `link`.
    Frame { link: LinkId, message: Message },
    /// The link is gone: connect failure, EOF, I/O or framing error.
    Closed { link: LinkId },
}

/// Accepts inbound bus connections until the coordinator goes away.
pub fn listen(listener: TcpListener, events: mpsc::Sender<LinkEvent>) {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!("cluster bus listening on {addr}");
        }
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("bus accept error: {e}");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            if events.send(LinkEvent::Accepted { stream, peer }).await.is_err() {
                break;
            }
        }
    });
}

/// Starts the tasks for an accepted connection. Returns the sender for
/// frames to write on it.
pub fn spawn_inbound(
    link: LinkId,
    stream: TcpStream,
    events: mpsc::Sender<LinkEvent>,
) -> mpsc::Sender<Bytes> {
    let (tx, rx) = mpsc::channel(LINK_QUEUE_DEPTH);
    tokio::spawn(run_link(link, stream, rx, events));
    tx
}

/// Connects to `addr` in the background. Frames sent before the
/// connection is up are queued; a failed connect reports the link closed.
pub fn spawn_outbound(
    link: LinkId,
    addr: SocketAddr,
    events: mpsc::Sender<LinkEvent>,
) -> mpsc::Sender<Bytes> {
    let (tx, rx) = mpsc::channel(LINK_QUEUE_DEPTH);
    tokio::spawn(async move {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                run_link(link, stream, rx, events).await;
            }
            Err(e) => {
                debug!("bus connect to {addr} failed: {e}");
                let _ = events.send(LinkEvent::Closed { link }).await;
            }
        }
    });
    tx
}

/// Writer loop for one link. The reader runs as its own task and is
/// stopped when the coordinator drops the frame sender.
async fn run_link(
    link: LinkId,
    stream: TcpStream,
    mut frames: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<LinkEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let reader_events = events.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(message) => {
                    let event = LinkEvent::Frame { link, message };
                    if reader_events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::UnexpectedEof {
                        debug!("bus read error on {link}: {e}");
                    }
                    let _ = reader_events.send(LinkEvent::Closed { link }).await;
                    return;
                }
            }
        }
    });

    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("bus write error on {link}: {e}");
            let _ = events.send(LinkEvent::Closed { link }).await;
            break;
        }
    }
    reader_task.abort();
    let _ = writer.shutdown().await;
}

/// Reads and decodes one frame.
pub async fn read_message<R>(r: &mut R) -> io::Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    r.read_exact(&mut prefix).await?;
    let len = frame_length(&prefix).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut buf = vec![0u8; len];
    buf[..PREFIX_LEN].copy_from_slice(&prefix);
    r.read_exact(&mut buf[PREFIX_LEN..]).await?;
    Message::decode(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
