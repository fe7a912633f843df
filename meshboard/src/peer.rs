//! One TCP link to another participant.
//!
//! A peer is *outgoing* (we called connect, and introduce ourselves with a
//! Join) or *incoming* (we accepted). Either way it runs two tasks: a
//! reader that reassembles frames and feeds the controller queue, and a
//! writer that drains a channel of pre-encoded bytes. The link becomes
//! *registered* once the remote identifies itself: with a Join on
//! incoming links, with the Image snapshot reply on outgoing ones.
//!
//! I/O errors never propagate: they flip the `enabled` flag and the
//! failure detector turns that into an InternalQuit for the controller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::controller::Event;
use crate::wire::{self, FrameReader, Message, SignedMessage};

/// Upper bound for a single socket read.
const READ_BUF_SIZE: usize = 64 * 1024;
/// Encoded frames queued per peer before sends start failing.
const OUTBOUND_QUEUE: usize = 256;

pub struct Peer {
    pub addr: SocketAddr,
    pub incoming: bool,
    client_id: Mutex<Option<String>>,
    enabled: AtomicBool,
    last_alive: Mutex<Instant>,
    outbound: mpsc::Sender<Arc<Vec<u8>>>,
    cancel: CancellationToken,
}

impl Peer {
    /// Start the reader and writer tasks for a fresh connection. Outgoing
    /// links immediately send `Join{own_id}` as the handshake.
    pub fn spawn(
        stream: TcpStream,
        incoming: bool,
        own_id: String,
        events: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<Peer>> {
        let addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let peer = Arc::new(Peer {
            addr,
            incoming,
            client_id: Mutex::new(None),
            enabled: AtomicBool::new(true),
            last_alive: Mutex::new(Instant::now()),
            outbound: outbound_tx,
            cancel,
        });

        tokio::spawn(write_loop(Arc::clone(&peer), write_half, outbound_rx));
        tokio::spawn(read_loop(Arc::clone(&peer), read_half, events));

        if !incoming {
            let join = Message::Join {
                client_id: own_id,
                received_from_id: None,
                address: None,
            };
            match wire::encode(&join) {
                Ok(bytes) => {
                    let _ = peer.outbound.try_send(Arc::new(bytes));
                }
                Err(e) => tracing::warn!(peer = %addr, "join handshake encode failed: {e}"),
            }
        }

        Ok(peer)
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().clone()
    }

    pub fn is_registered(&self) -> bool {
        self.client_id.lock().is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Registered and still healthy: eligible for broadcast.
    pub fn is_active(&self) -> bool {
        self.is_enabled() && self.is_registered()
    }

    pub fn last_alive(&self) -> Instant {
        *self.last_alive.lock()
    }

    /// Take the link out of service and stop both tasks. Idempotent.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Queue pre-encoded bytes. False means the link cannot accept writes
    /// any more and should be removed.
    pub fn send_bytes(&self, bytes: Arc<Vec<u8>>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.outbound.try_send(bytes).is_ok()
    }

    fn touch(&self) {
        *self.last_alive.lock() = Instant::now();
    }

    /// Registration rules for an inbound message. Returns false when the
    /// message must be dropped instead of forwarded to the controller.
    fn register(&self, msg: &mut Message) -> bool {
        match msg {
            Message::Join {
                client_id,
                received_from_id,
                address,
            } => {
                let mut registered = self.client_id.lock();
                match registered.clone() {
                    None => {
                        // First message on the link: the handshake. A bare
                        // received_from_id tells the controller to answer
                        // with an Image snapshot.
                        *registered = Some(client_id.clone());
                        *received_from_id = None;
                        *address = Some(self.addr);
                        tracing::info!(peer = %self.addr, client = %client_id, "peer registered via join");
                    }
                    Some(link_id) => {
                        // A join relayed by our direct neighbour.
                        *received_from_id = Some(link_id);
                    }
                }
                true
            }
            Message::Image { client_id, .. } => {
                let mut registered = self.client_id.lock();
                if registered.is_some() {
                    tracing::warn!(peer = %self.addr, "image from an already-registered peer, dropping");
                    false
                } else {
                    *registered = Some(client_id.clone());
                    tracing::info!(peer = %self.addr, client = %client_id, "peer registered via image");
                    true
                }
            }
            _ => true,
        }
    }
}

async fn read_loop(peer: Arc<Peer>, mut read_half: OwnedReadHalf, events: mpsc::Sender<Event>) {
    let mut frames = FrameReader::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = tokio::select! {
            _ = peer.cancel.cancelled() => break,
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::info!(peer = %peer.addr, "peer closed the connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(peer = %peer.addr, "read error: {e}");
                    break;
                }
            },
        };
        peer.touch();

        for frame in frames.push(&buf[..n]) {
            let mut msg = match wire::decode(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(peer = %peer.addr, "dropping undecodable frame: {e}");
                    continue;
                }
            };
            if !peer.register(&mut msg) {
                continue;
            }
            let signed = SignedMessage {
                client_id: peer.client_id(),
                message: msg,
            };
            if events.send(Event::Message(signed)).await.is_err() {
                // Controller gone; we are shutting down.
                peer.disable();
                return;
            }
        }
    }
    peer.disable();
}

async fn write_loop(
    peer: Arc<Peer>,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Arc<Vec<u8>>>,
) {
    loop {
        let bytes = tokio::select! {
            _ = peer.cancel.cancelled() => break,
            bytes = outbound.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };
        if let Err(e) = write_half.write_all(&bytes).await {
            tracing::warn!(peer = %peer.addr, "write error: {e}");
            break;
        }
    }
    peer.disable();
    let _ = write_half.shutdown().await;
}
