//! Reconciling fetched contacts with the local view.
//!
//! Fresh server fields always win except `unread_count` while a read hold is
//! open for the contact: selecting a conversation zeroes its count locally
//! before the server has processed the mark-read, and a fetch that raced the
//! mark-read must not bring the old count back. The hold closes once the
//! server has visibly caught up (fresh <= local) or once a fetch that started
//! after the mark-read acknowledgement lands.

use smsdesk::protocol::Contact;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, Default)]
struct ReadHold {
    /// First fetch generation started after the server acknowledged the mark-read.
    acked_at: Option<u64>,
}

/// Open read holds plus the contacts-fetch generation counter.
#[derive(Debug, Default)]
pub struct ReadHolds {
    holds: HashMap<String, ReadHold>,
    next_fetch: u64,
}

impl ReadHolds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or reopen) a hold for a contact that was just read locally.
    pub fn place(&mut self, contact_id: &str) {
        self.holds.insert(contact_id.to_string(), ReadHold::default());
    }

    /// The server acknowledged the mark-read.
    pub fn acknowledge(&mut self, contact_id: &str) {
        if let Some(hold) = self.holds.get_mut(contact_id) {
            hold.acked_at = Some(self.next_fetch);
        }
    }

    pub fn release(&mut self, contact_id: &str) {
        self.holds.remove(contact_id);
    }

    #[cfg(test)]
    pub fn is_held(&self, contact_id: &str) -> bool {
        self.holds.contains_key(contact_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.holds.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.holds.is_empty()
    }

    /// Stamp a contacts fetch that is about to start.
    pub fn begin_fetch(&mut self) -> u64 {
        let generation = self.next_fetch;
        self.next_fetch += 1;
        generation
    }
}

/// Merge one fetched contact against its local copy.
pub fn merge_contact(
    local: Option<&Contact>,
    fresh: Contact,
    holds: &mut ReadHolds,
    fetch: u64,
) -> Contact {
    let Some(hold) = holds.holds.get(&fresh.id).copied() else {
        return fresh;
    };
    if hold.acked_at.is_some_and(|acked_at| fetch >= acked_at) {
        holds.release(&fresh.id);
        return fresh;
    }
    let Some(local) = local else {
        holds.release(&fresh.id);
        return fresh;
    };
    if fresh.unread_count <= local.unread_count {
        holds.release(&fresh.id);
        return fresh;
    }
    Contact {
        unread_count: local.unread_count,
        ..fresh
    }
}

/// A contact whose unread count went up in a merge. New contacts count from zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadIncrease {
    pub contact: Contact,
    pub added: u32,
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub contacts: Vec<Contact>,
    pub increases: Vec<UnreadIncrease>,
}

/// Merge a full contacts fetch, keeping the server's ordering. Holds for
/// contacts that no longer exist are dropped.
pub fn merge_contacts(
    local: &[Contact],
    fresh: Vec<Contact>,
    holds: &mut ReadHolds,
    fetch: u64,
) -> MergeOutcome {
    let by_id: HashMap<&str, &Contact> = local.iter().map(|c| (c.id.as_str(), c)).collect();
    let present: HashSet<String> = fresh.iter().map(|c| c.id.clone()).collect();
    holds.holds.retain(|id, _| present.contains(id));

    let mut outcome = MergeOutcome::default();
    for contact in fresh {
        let previous = by_id.get(contact.id.as_str()).copied();
        let merged = merge_contact(previous, contact, holds, fetch);
        let before = previous.map(|c| c.unread_count).unwrap_or(0);
        if merged.unread_count > before {
            outcome.increases.push(UnreadIncrease {
                added: merged.unread_count - before,
                contact: merged.clone(),
            });
        }
        outcome.contacts.push(merged);
    }
    outcome
}
