//! Optimistic messages waiting for the server to confirm a send.

use chrono::Utc;
use smsdesk::protocol::{Direction, Message};
use std::collections::BTreeMap;

pub const TEMP_ID_PREFIX: &str = "tmp-";

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

#[derive(Debug, Clone)]
pub struct PendingSend {
    /// What the user sees until the server answers.
    pub message: Message,
    /// Text exactly as typed, restored into the input on failure.
    pub input: String,
    pub contact_id: String,
}

/// Temporary id to pending send. Ordered by insertion so rendering is stable.
#[derive(Debug, Default)]
pub struct PendingOverlay {
    pending: BTreeMap<(u64, String), PendingSend>,
    seq: u64,
}

impl PendingOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an optimistic outbound message and return its temporary id.
    pub fn insert(
        &mut self,
        phone_number_id: &str,
        from: &str,
        to: &str,
        contact_id: &str,
        input: &str,
    ) -> String {
        let id = format!("{TEMP_ID_PREFIX}{}", uuid::Uuid::new_v4());
        let message = Message {
            id: id.clone(),
            phone_number_id: phone_number_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            body: input.trim().to_string(),
            direction: Direction::Outbound,
            timestamp: Utc::now(),
            sid: None,
        };
        self.seq += 1;
        self.pending.insert(
            (self.seq, id.clone()),
            PendingSend {
                message,
                input: input.to_string(),
                contact_id: contact_id.to_string(),
            },
        );
        id
    }

    pub fn remove(&mut self, temp_id: &str) -> Option<PendingSend> {
        let key = self.pending.keys().find(|(_, id)| id == temp_id).cloned()?;
        self.pending.remove(&key)
    }

    #[cfg(test)]
    pub fn get(&self, temp_id: &str) -> Option<&PendingSend> {
        self.pending
            .iter()
            .find(|((_, id), _)| id == temp_id)
            .map(|(_, p)| p)
    }

    /// Optimistic messages for one contact, oldest first.
    pub fn messages_for<'a>(&'a self, contact_id: &'a str) -> impl Iterator<Item = &'a Message> + 'a {
        self.pending
            .values()
            .filter(move |p| p.contact_id == contact_id)
            .map(|p| &p.message)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_builds_outbound_temp_message() {
        let mut overlay = PendingOverlay::new();
        let id = overlay.insert("pn-1", "+15550000001", "+15551230001", "c1", " hi ");
        assert!(is_temp_id(&id));
        let pending = overlay.get(&id).unwrap();
        assert_eq!(pending.message.body, "hi");
        assert_eq!(pending.input, " hi ");
        assert_eq!(pending.message.direction, Direction::Outbound);
        assert_eq!(pending.message.sid, None);
    }

    #[test]
    fn messages_for_contact_in_order() {
        let mut overlay = PendingOverlay::new();
        overlay.insert("pn-1", "+15550000001", "+15551230001", "c1", "one");
        overlay.insert("pn-1", "+15550000001", "+15551230002", "c2", "other");
        overlay.insert("pn-1", "+15550000001", "+15551230001", "c1", "two");
        let bodies: Vec<&str> = overlay.messages_for("c1").map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two"]);
    }

    #[test]
    fn remove_returns_pending() {
        let mut overlay = PendingOverlay::new();
        let id = overlay.insert("pn-1", "+15550000001", "+15551230001", "c1", "hi");
        assert_eq!(overlay.remove(&id).unwrap().contact_id, "c1");
        assert!(overlay.remove(&id).is_none());
        assert!(overlay.is_empty());
    }
}
