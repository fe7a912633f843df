//! The pool of peer links.
//!
//! Owns the listening socket and every [`Peer`]. Three tasks mutate the
//! peer list (the acceptor, the keep-alive sweeper, and, through send
//! failures, the controller), so it sits behind a mutex. Removing a peer
//! enqueues an `InternalQuit` so the membership change propagates through
//! the controller like any other event.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::controller::Event;
use crate::peer::Peer;
use crate::wire::{self, Message, SignedMessage};

pub struct PeerPool {
    own_id: String,
    keep_alive_timeout: Duration,
    peers: Mutex<Vec<Arc<Peer>>>,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
}

impl PeerPool {
    pub fn new(
        own_id: String,
        keep_alive_timeout: Duration,
        events: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            own_id,
            keep_alive_timeout,
            peers: Mutex::new(Vec::new()),
            events,
            cancel,
        })
    }

    /// Accept connections until shutdown.
    pub async fn run_acceptor(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::info!(peer = %addr, "accepted connection");
                        self.add_peer(stream, true);
                    }
                    Err(e) => tracing::warn!("accept error: {e}"),
                },
            }
        }
        tracing::debug!("acceptor stopped");
    }

    /// Dial another participant. The new peer introduces itself with a
    /// Join and registers once the Image snapshot comes back.
    pub async fn connect_to(&self, addr: &str) -> anyhow::Result<()> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        tracing::info!(peer = %addr, "connected");
        self.add_peer(stream, false);
        Ok(())
    }

    fn add_peer(&self, stream: TcpStream, incoming: bool) {
        match Peer::spawn(
            stream,
            incoming,
            self.own_id.clone(),
            self.events.clone(),
            self.cancel.child_token(),
        ) {
            Ok(peer) => self.peers.lock().push(peer),
            Err(e) => tracing::warn!("failed to start peer tasks: {e}"),
        }
    }

    /// Broadcast to every active peer except `exclude`. The message is
    /// serialised once and the bytes shared across links. A failed write
    /// removes the peer.
    pub fn send(&self, msg: &Message, exclude: Option<&str>) {
        let bytes = match wire::encode(msg) {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                tracing::warn!("broadcast encode failed: {e}");
                return;
            }
        };
        let peers: Vec<Arc<Peer>> = self.peers.lock().clone();
        if peers.is_empty() {
            tracing::debug!("no peers connected");
            return;
        }
        for peer in peers {
            if !peer.is_active() {
                continue;
            }
            let Some(id) = peer.client_id() else { continue };
            if exclude == Some(id.as_str()) {
                continue;
            }
            if !peer.send_bytes(Arc::clone(&bytes)) {
                tracing::warn!(client = %id, "send failed, removing peer");
                self.remove(&peer);
            }
        }
    }

    /// Write to the single peer registered under `client_id`.
    pub fn send_to_client(&self, msg: &Message, client_id: &str) {
        let peer = self
            .peers
            .lock()
            .iter()
            .find(|p| p.client_id().as_deref() == Some(client_id))
            .cloned();
        let Some(peer) = peer else {
            tracing::warn!(client = %client_id, "no link to client");
            return;
        };
        if !peer.is_active() {
            tracing::warn!(client = %client_id, "link to client is inactive");
            return;
        }
        match wire::encode(msg) {
            Ok(bytes) => {
                if !peer.send_bytes(Arc::new(bytes)) {
                    tracing::warn!(client = %client_id, "send failed, removing peer");
                    self.remove(&peer);
                }
            }
            Err(e) => tracing::warn!("encode failed: {e}"),
        }
    }

    /// One failure-detection sweep: drop every peer that died or went
    /// silent past the keep-alive timeout.
    pub fn check_alive(&self) {
        let stale: Vec<Arc<Peer>> = self
            .peers
            .lock()
            .iter()
            .filter(|p| !p.is_enabled() || p.last_alive().elapsed() > self.keep_alive_timeout)
            .cloned()
            .collect();
        for peer in stale {
            tracing::info!(peer = %peer.addr, client = ?peer.client_id(), "removing dead peer");
            self.remove(&peer);
        }
    }

    /// Heartbeat + failure detector, once per interval. The heartbeat is a
    /// re-announcement of ourselves: receivers already know us, so it is a
    /// no-op join that merely keeps `last_alive` fresh on every link.
    pub async fn run_keep_alive(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // skip the immediate tick
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.send(
                        &Message::Join {
                            client_id: self.own_id.clone(),
                            received_from_id: None,
                            address: None,
                        },
                        None,
                    );
                    self.check_alive();
                }
            }
        }
        tracing::debug!("keep-alive stopped");
    }

    /// Disable a peer, evict it, and tell the controller. Only the caller
    /// that actually evicted the entry reports the quit.
    pub fn remove(&self, peer: &Arc<Peer>) {
        peer.disable();
        {
            let mut peers = self.peers.lock();
            let before = peers.len();
            peers.retain(|p| !Arc::ptr_eq(p, peer));
            if peers.len() == before {
                return; // someone else already removed it
            }
        }
        let quit = SignedMessage {
            client_id: Some(self.own_id.clone()),
            message: Message::InternalQuit {
                client_id: peer.client_id(),
            },
        };
        if self.events.try_send(Event::Message(quit)).is_err() {
            tracing::warn!("event queue unavailable, internal quit dropped");
        }
    }
}
