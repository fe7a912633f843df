//! Token + Ricart–Agrawala mutual exclusion.
//!
//! One token circulates; whoever holds it may lock the board. Everyone
//! keeps a (R, G) pair per participant: R is the logical time of the last
//! token request, G the time of the last completed critical section, and
//! `R > G` marks a participant as waiting. On release the token moves to
//! the first waiting participant clockwise from the holder in the id-sorted
//! ring, which makes the hand-off target identical on every node.
//!
//! The clock advances only on local claims. Remote timestamps land directly
//! in the target participant's R column and never lift the local clock.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::controller::Event;
use crate::membership::MembershipTable;
use crate::wire::{Message, RicartRow, SignedMessage};

/// Per-process monotonic logical clock.
#[derive(Debug, Default)]
pub struct LogicalClock {
    time: u64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock and return the new value.
    pub fn increase(&mut self) -> u64 {
        self.time += 1;
        self.time
    }

    pub fn get(&self) -> u64 {
        self.time
    }
}

pub struct OwnershipManager {
    clock: LogicalClock,
    /// How long a holder may keep the token before it is forced to resign.
    token_deadline: Duration,
    /// Handle of the pending auto-resign timer, aborted when a new deadline
    /// supersedes it. A stale timer that fires anyway is harmless: resign()
    /// short-circuits unless we still hold the token.
    resign_timer: Option<JoinHandle<()>>,
    /// Queue back into the controller, used by the deadline timer.
    events: mpsc::Sender<Event>,
}

impl OwnershipManager {
    pub fn new(token_deadline: Duration, events: mpsc::Sender<Event>) -> Self {
        Self {
            clock: LogicalClock::new(),
            token_deadline,
            resign_timer: None,
            events,
        }
    }

    /// Try to take the board. Holding the token already means locking it in
    /// place and announcing that with a self-addressed PassToken; otherwise
    /// a Request goes out and the current holder decides.
    pub fn claim_ownership(&mut self, table: &mut MembershipTable) -> Option<Message> {
        let own = table.own_id().to_string();
        if table.owns_token() {
            table.token_owner = Some(own.clone());
            table.locked = true;
            let t = self.clock.increase();
            let me = table.get_mut(&own)?;
            me.granted = t;
            me.requested = t;
            self.schedule_auto_resign(&own);
            tracing::info!("board locked (we hold the token)");
            Some(Message::PassToken {
                dest_client_id: own,
                ricart_table: table.to_ricart(),
            })
        } else {
            let t = self.clock.increase();
            table.get_mut(&own)?.requested = t;
            tracing::info!(logical_time = t, "requesting the token");
            Some(Message::Request {
                client_id: own,
                logical_time: t,
            })
        }
    }

    /// Give up the token. Passes it to the next waiting participant in the
    /// ring if there is one, otherwise announces a plain resign. Calling
    /// this without holding the token is silently ignored.
    pub fn resign(&mut self, table: &mut MembershipTable) -> Option<Message> {
        if !table.owns_token() {
            return None;
        }
        let own = table.own_id().to_string();
        table.locked = false;
        table.get_mut(&own)?.granted = self.clock.get();

        match next_token_owner(table) {
            Some(next) => {
                table.token_owner = Some(next.clone());
                table.locked = true;
                tracing::info!(to = %next, "passing the token");
                Some(Message::PassToken {
                    dest_client_id: next,
                    ricart_table: table.to_ricart(),
                })
            }
            None => {
                tracing::info!("nobody waiting for the token, resigning in place");
                Some(Message::Resign { client_id: own })
            }
        }
    }

    /// Apply a PassToken. Returns true iff the token landed on us, in which
    /// case the auto-resign deadline starts ticking.
    pub fn process_pass_token(
        &mut self,
        table: &mut MembershipTable,
        dest_client_id: &str,
        ricart_table: &[RicartRow],
    ) -> bool {
        table.token_owner = Some(dest_client_id.to_string());
        table.locked = true;
        table.update_with_ricart(ricart_table);

        let ours = dest_client_id == table.own_id();
        if ours {
            let own = table.own_id().to_string();
            self.schedule_auto_resign(&own);
        }
        ours
    }

    /// Handle a token request. Only meaningful at the holder: record the
    /// requester's logical time, and hand the token over right away when
    /// the board is not locked.
    pub fn process_request(
        &mut self,
        table: &mut MembershipTable,
        client_id: &str,
        logical_time: u64,
    ) -> Option<Message> {
        if !table.owns_token() {
            tracing::warn!(client = %client_id, "token requested, but we are not the holder");
            return None;
        }
        let Some(requester) = table.get_mut(client_id) else {
            tracing::warn!(client = %client_id, "token request from unknown participant");
            return None;
        };
        requester.requested = logical_time;
        if !table.locked {
            self.resign(table)
        } else {
            // The requester waits for our resign or the deadline.
            None
        }
    }

    /// Another participant released the lock without passing the token.
    pub fn register_others_resign(&mut self, table: &mut MembershipTable) {
        table.locked = false;
    }

    /// (Re)arm the one-shot deadline; when it fires, the controller runs
    /// the resign so the single-consumer rule stays intact.
    fn schedule_auto_resign(&mut self, own_id: &str) {
        if let Some(old) = self.resign_timer.take() {
            old.abort();
        }
        let events = self.events.clone();
        let deadline = self.token_deadline;
        let own_id = own_id.to_string();
        self.resign_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            tracing::debug!("token ownership time elapsed");
            let _ = events
                .send(Event::Message(SignedMessage {
                    client_id: Some(own_id),
                    message: Message::InternalReload,
                }))
                .await;
        }));
    }
}

/// Ring rule: walk the id-sorted participants clockwise from self and pick
/// the first one with R > G.
fn next_token_owner(table: &MembershipTable) -> Option<String> {
    let mut ring: Vec<_> = table.participants().iter().collect();
    ring.sort_by(|a, b| a.id.cmp(&b.id));
    let own_idx = ring.iter().position(|p| p.id == table.own_id())?;
    let n = ring.len();
    (1..n)
        .map(|j| ring[(own_idx + j) % n])
        .find(|p| p.has_requested())
        .map(|p| p.id.clone())
}
