//! Single-consumer event loop.
//!
//! Every state transition (membership, token ownership, canvas) happens
//! on this one task. Peer readers, the failure detector, the auto-resign
//! timer, and the embedding handle all talk to it through one bounded
//! queue; nothing else touches the table or the ownership manager.
//!
//! Every message that came off the wire is re-broadcast to all active
//! peers except the link it arrived on. With the peer graph being a tree
//! (each participant connects to exactly one introducer) this flood-fill
//! needs no further loop suppression.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::canvas::Canvas;
use crate::membership::MembershipTable;
use crate::ownership::OwnershipManager;
use crate::pool::PeerPool;
use crate::wire::{Color, Message, Point, SignedMessage, TokenInfo};

/// What travels on the controller queue: messages (from the wire or
/// synthesized internally) and local commands from the embedding handle.
#[derive(Debug)]
pub enum Event {
    Message(SignedMessage),
    Command(Command),
}

/// Local actions from the embedding handle: claim, resign, draw, clean.
#[derive(Debug)]
pub enum Command {
    ClaimOwnership,
    Resign,
    Stroke { points: Vec<Point>, color: Color },
    Clean,
}

/// Immutable snapshot of the board state, published after every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardView {
    pub participants: Vec<ParticipantView>,
    pub token_owner: Option<String>,
    pub locked: bool,
    /// Whether local strokes are currently allowed: false only while the
    /// board is locked by somebody else.
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantView {
    pub id: String,
    pub granted: u64,
    pub requested: u64,
    pub received_from_id: Option<String>,
}

fn board_view(table: &MembershipTable) -> BoardView {
    BoardView {
        participants: table
            .participants()
            .iter()
            .map(|p| ParticipantView {
                id: p.id.clone(),
                granted: p.granted,
                requested: p.requested,
                received_from_id: p.received_from_id.clone(),
            })
            .collect(),
        token_owner: table.token_owner.clone(),
        locked: table.locked,
        writable: !(table.locked && !table.owns_token()),
    }
}

pub struct Controller {
    own_id: String,
    table: MembershipTable,
    ownership: OwnershipManager,
    pool: Arc<PeerPool>,
    canvas: Arc<dyn Canvas>,
    view_tx: watch::Sender<BoardView>,
    cancel: CancellationToken,
}

impl Controller {
    pub fn new(
        own_id: String,
        ownership: OwnershipManager,
        pool: Arc<PeerPool>,
        canvas: Arc<dyn Canvas>,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<BoardView>) {
        let table = MembershipTable::new(own_id.clone());
        let (view_tx, view_rx) = watch::channel(board_view(&table));
        (
            Self {
                own_id,
                table,
                ownership,
                pool,
                canvas,
                view_tx,
                cancel,
            },
            view_rx,
        )
    }

    /// Drain the queue until shutdown.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                Event::Message(signed) => self.handle_message(signed),
                Event::Command(command) => self.handle_command(command),
            }
            self.publish_view();
        }
        tracing::debug!("controller stopped");
    }

    fn handle_message(&mut self, signed: SignedMessage) {
        let sender = signed.client_id;
        let msg = signed.message;
        match &msg {
            Message::Paint { point_list, color } => {
                self.canvas.apply_stroke(point_list, *color);
            }

            Message::Image {
                client_id,
                png,
                client_list,
                token,
            } => {
                self.table.update_with_id_list(client_list, client_id);
                self.table.token_owner = token.client_id.clone();
                self.table.locked = token.has_lock;
                self.table.add(client_id, None);
                self.canvas.apply_png(png);
                tracing::info!(
                    from = %client_id,
                    participants = client_list.len(),
                    owner = ?token.client_id,
                    "adopted board snapshot"
                );
            }

            Message::Join {
                client_id,
                received_from_id,
                address,
            } => match received_from_id {
                None => {
                    // Joined directly to us: answer with the full board state
                    // so the newcomer can bootstrap.
                    self.table.add(client_id, None);
                    tracing::info!(client = %client_id, addr = ?address, "participant joined");
                    let image = Message::Image {
                        client_id: self.own_id.clone(),
                        png: self.canvas.png_snapshot(),
                        client_list: self.table.ids(),
                        token: TokenInfo {
                            client_id: self.table.token_owner.clone(),
                            has_lock: self.table.locked,
                        },
                    };
                    self.pool.send_to_client(&image, client_id);
                }
                Some(from) => {
                    self.table.add(client_id, Some(from.as_str()));
                }
            },

            Message::Quit {
                client_ids,
                detected_by,
            } => {
                self.table.remove_remote(client_ids, detected_by);
            }

            Message::Clean { client_id } => {
                tracing::info!(by = %client_id, "board cleaned");
                self.canvas.clear();
            }

            Message::Request {
                client_id,
                logical_time,
            } => {
                if let Some(reply) =
                    self.ownership
                        .process_request(&mut self.table, client_id, *logical_time)
                {
                    self.pool.send(&reply, None);
                }
            }

            Message::Resign { .. } => {
                self.ownership.register_others_resign(&mut self.table);
            }

            Message::PassToken {
                dest_client_id,
                ricart_table,
            } => {
                if self
                    .ownership
                    .process_pass_token(&mut self.table, dest_client_id, ricart_table)
                {
                    tracing::info!("token received");
                }
            }

            Message::InternalQuit { client_id } => {
                if let Some(id) = client_id {
                    let removed = self.table.remove(id);
                    if !removed.is_empty() {
                        self.pool.send(
                            &Message::Quit {
                                client_ids: removed,
                                detected_by: self.own_id.clone(),
                            },
                            None,
                        );
                    }
                }
                return;
            }

            Message::InternalReload => {
                // The auto-resign deadline. The resign is a no-op unless we
                // still hold the token; the view refresh happens below as
                // for every event.
                if let Some(reply) = self.ownership.resign(&mut self.table) {
                    self.pool.send(&reply, None);
                }
                return;
            }
        }

        // Flood-fill: forward everything that came off the wire, minus the
        // link it arrived on.
        self.pool.send(&msg, sender.as_deref());
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ClaimOwnership => {
                if let Some(msg) = self.ownership.claim_ownership(&mut self.table) {
                    self.pool.send(&msg, None);
                }
            }
            Command::Resign => {
                if let Some(msg) = self.ownership.resign(&mut self.table) {
                    self.pool.send(&msg, None);
                }
            }
            Command::Stroke { points, color } => {
                if self.table.locked && !self.table.owns_token() {
                    tracing::warn!("board is locked by another participant, stroke ignored");
                    return;
                }
                self.canvas.apply_stroke(&points, color);
                self.pool.send(
                    &Message::Paint {
                        point_list: points,
                        color,
                    },
                    None,
                );
            }
            Command::Clean => {
                self.canvas.clear();
                self.pool.send(
                    &Message::Clean {
                        client_id: self.own_id.clone(),
                    },
                    None,
                );
            }
        }
    }

    fn publish_view(&self) {
        let view = board_view(&self.table);
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}
