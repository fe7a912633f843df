//! Node wiring and the embedding handle.
//!
//! [`start`] binds the listener (the only fatal error in the system),
//! spawns the acceptor, keep-alive, and controller tasks, and returns a
//! [`NodeHandle`] the embedder drives: connect to a board, claim or give
//! up the token, draw, and watch the board state converge.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::canvas::{Canvas, StrokeBuffer};
use crate::config::Config;
use crate::controller::{BoardView, Command, Controller, Event};
use crate::ident;
use crate::ownership::OwnershipManager;
use crate::pool::PeerPool;
use crate::wire::{Color, Point};

/// Bound of the controller queue.
const EVENT_QUEUE: usize = 1024;

/// Bind the listener and bring the node up.
pub async fn start(config: Config, canvas: Arc<dyn Canvas>) -> Result<NodeHandle> {
    let own_id = ident::generate();
    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

    let socket = TcpSocket::new_v4().context("creating listener socket")?;
    socket.set_reuseaddr(true).context("setting SO_REUSEADDR")?;
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    socket
        .bind(bind_addr)
        .with_context(|| format!("binding {bind_addr}"))?;
    let listener = socket.listen(1).context("listening")?;
    let local_addr = listener.local_addr().context("resolving bound address")?;
    tracing::info!(id = %own_id, addr = %local_addr, "node listening");

    let pool = PeerPool::new(
        own_id.clone(),
        Duration::from_secs(config.keep_alive_timeout),
        events_tx.clone(),
        cancel.clone(),
    );
    let ownership = OwnershipManager::new(
        Duration::from_secs(config.token_ownership_max_time),
        events_tx.clone(),
    );
    let (controller, view_rx) = Controller::new(
        own_id.clone(),
        ownership,
        Arc::clone(&pool),
        canvas,
        cancel.clone(),
    );

    tokio::spawn(Arc::clone(&pool).run_acceptor(listener));
    tokio::spawn(Arc::clone(&pool).run_keep_alive(Duration::from_secs(
        config.keep_alive_interval,
    )));
    tokio::spawn(controller.run(events_rx));

    if let Some(ref addr) = config.connect {
        pool.connect_to(addr).await?;
    }

    Ok(NodeHandle {
        own_id,
        local_addr,
        pool,
        events: events_tx,
        view_rx,
        cancel,
        pen: Mutex::new(StrokeBuffer::new(config.line_max_length)),
    })
}

pub struct NodeHandle {
    own_id: String,
    local_addr: SocketAddr,
    pool: Arc<PeerPool>,
    events: mpsc::Sender<Event>,
    view_rx: watch::Receiver<BoardView>,
    cancel: CancellationToken,
    pen: Mutex<StrokeBuffer>,
}

impl NodeHandle {
    pub fn client_id(&self) -> &str {
        &self.own_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Join the board some other participant is on.
    pub async fn connect_to(&self, addr: &str) -> Result<()> {
        self.pool.connect_to(addr).await
    }

    /// Ask for the write token (or lock the board if we already hold it).
    pub async fn claim_ownership(&self) {
        self.command(Command::ClaimOwnership).await;
    }

    /// Release the lock, passing the token on if anyone is waiting.
    pub async fn resign(&self) {
        self.command(Command::Resign).await;
    }

    /// Draw one batch of points. Ignored while the board is locked by
    /// another participant.
    pub async fn stroke(&self, points: Vec<Point>, color: Color) {
        self.command(Command::Stroke { points, color }).await;
    }

    /// Feed a single pen position; batches are cut and sent automatically
    /// once they grow past the configured line length.
    pub async fn pen_point(&self, point: Point) {
        let batch = self.pen.lock().push(point);
        if let Some((points, color)) = batch {
            self.command(Command::Stroke { points, color }).await;
        }
    }

    /// Pen up: send whatever the buffer still holds.
    pub async fn pen_up(&self) {
        let batch = self.pen.lock().flush();
        if let Some((points, color)) = batch {
            self.command(Command::Stroke { points, color }).await;
        }
    }

    pub fn set_pen_color(&self, color: Color) {
        self.pen.lock().set_color(color);
    }

    /// Wipe the board everywhere.
    pub async fn clean(&self) {
        self.command(Command::Clean).await;
    }

    /// Watch the board state; a new value is published after every applied
    /// event.
    pub fn watch_board(&self) -> watch::Receiver<BoardView> {
        self.view_rx.clone()
    }

    /// Current board state.
    pub fn board(&self) -> BoardView {
        self.view_rx.borrow().clone()
    }

    /// Stop every task and close every socket. Idempotent; safe to call
    /// while peers are mid-write.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn command(&self, command: Command) {
        if self.events.send(Event::Command(command)).await.is_err() {
            tracing::warn!("controller queue closed, command dropped");
        }
    }
}
