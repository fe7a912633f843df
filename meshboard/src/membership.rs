//! Membership table: every participant we know about and how we learned
//! about them.
//!
//! Participants reached over a direct TCP link have no provenance; those
//! learned through a neighbour carry `received_from_id`, so when a link dies
//! the whole subtree that was only reachable through it goes with it. The
//! table also tracks the current token owner and whether the board is
//! locked. Only the controller task ever touches it, so it carries no lock.

use crate::wire::RicartRow;

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    /// Direct neighbour that introduced this participant; `None` for self
    /// and for directly connected peers.
    pub received_from_id: Option<String>,
    /// Logical time of the last completed critical section (G).
    pub granted: u64,
    /// Logical time of the last token request (R).
    pub requested: u64,
}

impl Participant {
    fn new(id: String, received_from_id: Option<String>) -> Self {
        Self {
            id,
            received_from_id,
            granted: 0,
            requested: 0,
        }
    }

    /// A participant is waiting for the token iff R > G.
    pub fn has_requested(&self) -> bool {
        self.requested > self.granted
    }

    pub fn to_ricart(&self) -> RicartRow {
        RicartRow {
            client_id: self.id.clone(),
            requested: self.requested,
            granted: self.granted,
        }
    }
}

#[derive(Debug)]
pub struct MembershipTable {
    own_id: String,
    participants: Vec<Participant>,
    /// Who currently holds the token. Starts as ourselves: a lone node owns
    /// the board until it joins someone else's.
    pub token_owner: Option<String>,
    /// Whether the holder is inside the critical section.
    pub locked: bool,
}

impl MembershipTable {
    pub fn new(own_id: String) -> Self {
        let participants = vec![Participant::new(own_id.clone(), None)];
        Self {
            token_owner: Some(own_id.clone()),
            locked: false,
            own_id,
            participants,
        }
    }

    pub fn own_id(&self) -> &str {
        &self.own_id
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// True iff we believe we hold the token.
    pub fn owns_token(&self) -> bool {
        self.token_owner.as_deref() == Some(self.own_id.as_str())
    }

    /// Idempotent insert; an already-known id keeps its provenance.
    pub fn add(&mut self, id: &str, received_from_id: Option<&str>) {
        if !self.contains(id) {
            self.participants.push(Participant::new(
                id.to_string(),
                received_from_id.map(str::to_string),
            ));
        }
    }

    /// Remove a directly connected participant and everyone learned through
    /// it. We are the detector, so a token held by any of them falls to us.
    /// Returns the removed ids, for the Quit announcement.
    pub fn remove(&mut self, id: &str) -> Vec<String> {
        let own = self.own_id.clone();
        let mut removed = Vec::new();
        if !self.remove_entry(id, &own) {
            return removed;
        }
        removed.push(id.to_string());

        let orphans: Vec<String> = self
            .participants
            .iter()
            .filter(|p| p.received_from_id.as_deref() == Some(id))
            .map(|p| p.id.clone())
            .collect();
        for orphan in orphans {
            if self.remove_entry(&orphan, &own) {
                tracing::debug!(client = %orphan, via = %id, "removed participant learned through lost neighbour");
                removed.push(orphan);
            }
        }
        removed
    }

    /// Apply a received Quit: drop each named participant; a token held by
    /// any of them is inherited by the detector.
    pub fn remove_remote(&mut self, client_ids: &[String], detected_by: &str) {
        for id in client_ids {
            self.remove_entry(id, detected_by);
        }
    }

    fn remove_entry(&mut self, id: &str, detected_by: &str) -> bool {
        let Some(pos) = self.participants.iter().position(|p| p.id == id) else {
            tracing::warn!(client = %id, "cannot remove participant: not in table");
            return false;
        };
        self.participants.remove(pos);
        if self.token_owner.as_deref() == Some(id) {
            self.locked = false;
            self.token_owner = Some(detected_by.to_string());
            tracing::info!(from = %id, to = %detected_by, "token inherited from removed participant");
        }
        true
    }

    /// Merge a participant list revealed by an Image snapshot; every id we
    /// did not know yet is recorded as learned from `from`.
    pub fn update_with_id_list(&mut self, client_ids: &[String], from: &str) {
        for id in client_ids {
            if id != from {
                self.add(id, Some(from));
            }
        }
    }

    pub fn to_ricart(&self) -> Vec<RicartRow> {
        self.participants.iter().map(Participant::to_ricart).collect()
    }

    /// Overwrite the (R, G) columns from a received table snapshot. Rows
    /// naming participants we do not know are skipped.
    pub fn update_with_ricart(&mut self, rows: &[RicartRow]) {
        for row in rows {
            match self.get_mut(&row.client_id) {
                Some(p) => {
                    p.requested = row.requested;
                    p.granted = row.granted;
                }
                None => {
                    tracing::warn!(client = %row.client_id, "ricart row for unknown participant, skipping");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MembershipTable {
        MembershipTable::new("me".into())
    }

    #[test]
    fn starts_with_self_owning_the_token() {
        let t = table();
        assert_eq!(t.ids(), vec!["me".to_string()]);
        assert_eq!(t.token_owner.as_deref(), Some("me"));
        assert!(!t.locked);
        assert!(t.owns_token());
    }

    #[test]
    fn add_is_idempotent_and_keeps_provenance() {
        let mut t = table();
        t.add("a", None);
        t.add("a", Some("b"));
        assert_eq!(t.participants().len(), 2);
        assert_eq!(t.get("a").unwrap().received_from_id, None);
    }

    #[test]
    fn remove_cascades_to_participants_learned_through_the_link() {
        let mut t = table();
        t.add("a", None);
        t.add("b", Some("a"));
        t.add("c", Some("a"));
        t.add("d", Some("other"));
        t.add("other", None);

        let removed = t.remove("a");
        assert_eq!(removed, vec!["a".to_string(), "b".into(), "c".into()]);
        assert!(!t.contains("a"));
        assert!(!t.contains("b"));
        assert!(t.contains("d"));
    }

    #[test]
    fn remove_of_token_holder_hands_the_token_to_us() {
        let mut t = table();
        t.add("a", None);
        t.token_owner = Some("a".into());
        t.locked = true;

        t.remove("a");
        assert_eq!(t.token_owner.as_deref(), Some("me"));
        assert!(!t.locked);
    }

    #[test]
    fn remove_remote_hands_the_token_to_the_detector() {
        let mut t = table();
        t.add("a", None);
        t.add("b", Some("a"));
        t.add("detector", None);
        t.token_owner = Some("b".into());
        t.locked = true;

        t.remove_remote(&["a".into(), "b".into()], "detector");
        assert!(!t.contains("a"));
        assert!(!t.contains("b"));
        assert_eq!(t.token_owner.as_deref(), Some("detector"));
        assert!(!t.locked);
    }

    #[test]
    fn remove_of_unknown_id_is_a_no_op() {
        let mut t = table();
        assert!(t.remove("ghost").is_empty());
        t.remove_remote(&["ghost".into()], "a");
        assert_eq!(t.ids(), vec!["me".to_string()]);
    }

    #[test]
    fn id_list_merge_skips_the_sender() {
        let mut t = table();
        t.update_with_id_list(&["a".into(), "b".into(), "me".into()], "a");
        assert!(!t.contains("a")); // the sender itself is added separately
        assert_eq!(t.get("b").unwrap().received_from_id.as_deref(), Some("a"));
        assert_eq!(t.participants().len(), 2);
    }

    #[test]
    fn ricart_projection_roundtrips() {
        let mut t = table();
        t.add("a", None);
        t.get_mut("a").unwrap().requested = 4;
        t.get_mut("a").unwrap().granted = 2;

        let rows = t.to_ricart();
        let mut other = MembershipTable::new("me".into());
        other.add("a", None);
        other.update_with_ricart(&rows);
        assert_eq!(other.get("a").unwrap().requested, 4);
        assert_eq!(other.get("a").unwrap().granted, 2);
        assert!(other.get("a").unwrap().has_requested());
    }

    #[test]
    fn ricart_rows_for_unknown_ids_are_skipped() {
        let mut t = table();
        t.update_with_ricart(&[RicartRow {
            client_id: "ghost".into(),
            requested: 9,
            granted: 1,
        }]);
        assert!(!t.contains("ghost"));
    }
}
