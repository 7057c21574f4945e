//! One re-sync gate per fetched resource.
//!
//! Poll ticks and real-time hints both ask for a re-fetch. At most one fetch
//! per resource is in flight; a poll tick that finds one running is dropped,
//! while a hint marks the resource dirty so exactly one follow-up fetch runs
//! once the current one finishes.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Contact list of a phone number id.
    Contacts(String),
    /// Message history of a contact id.
    Conversation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Poll,
    Hint,
}

#[derive(Debug, Clone, Copy)]
struct GateState {
    /// Ticket of the fetch currently in flight.
    ticket: u64,
    dirty: bool,
}

/// Outcome of [`ResyncGate::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finished {
    /// The fetch was superseded or forgotten; discard its result.
    Stale,
    Done,
    /// Apply the result and start a follow-up fetch under this ticket.
    FollowUp(u64),
}

#[derive(Debug, Default)]
pub struct ResyncGate {
    states: HashMap<Resource, GateState>,
    next_ticket: u64,
}

impl ResyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a fetch. Returns the ticket to start one under, or `None`
    /// when one is already running.
    pub fn request(&mut self, resource: &Resource, trigger: Trigger) -> Option<u64> {
        if let Some(state) = self.states.get_mut(resource) {
            match trigger {
                Trigger::Poll => tracing::trace!(?resource, "poll skipped, fetch in flight"),
                Trigger::Hint => state.dirty = true,
            }
            return None;
        }
        let ticket = self.issue();
        self.states.insert(
            resource.clone(),
            GateState {
                ticket,
                dirty: false,
            },
        );
        Some(ticket)
    }

    /// The fetch holding `ticket` finished.
    pub fn finish(&mut self, resource: &Resource, ticket: u64) -> Finished {
        let Some(state) = self.states.get(resource).copied() else {
            return Finished::Stale;
        };
        if state.ticket != ticket {
            return Finished::Stale;
        }
        if state.dirty {
            let follow_up = self.issue();
            self.states.insert(
                resource.clone(),
                GateState {
                    ticket: follow_up,
                    dirty: false,
                },
            );
            return Finished::FollowUp(follow_up);
        }
        self.states.remove(resource);
        Finished::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contacts() -> Resource {
        Resource::Contacts("pn-1".into())
    }

    #[test]
    fn poll_while_in_flight_is_skipped() {
        let mut gate = ResyncGate::new();
        let ticket = gate.request(&contacts(), Trigger::Poll).unwrap();
        assert_eq!(gate.request(&contacts(), Trigger::Poll), None);
        assert_eq!(gate.finish(&contacts(), ticket), Finished::Done);
        assert!(!gate.is_in_flight(&contacts()));
    }

    #[test]
    fn hints_coalesce_into_one_follow_up() {
        let mut gate = ResyncGate::new();
        let first = gate.request(&contacts(), Trigger::Hint).unwrap();
        assert_eq!(gate.request(&contacts(), Trigger::Hint), None);
        assert_eq!(gate.request(&contacts(), Trigger::Hint), None);
        let Finished::FollowUp(second) = gate.finish(&contacts(), first) else {
            panic!("expected one follow-up");
        };
        assert!(gate.is_in_flight(&contacts()));
        assert_eq!(gate.finish(&contacts(), second), Finished::Done, "and only one");
    }

    #[test]
    fn resources_are_independent() {
        let mut gate = ResyncGate::new();
        let convo = Resource::Conversation("c1".into());
        assert!(gate.request(&contacts(), Trigger::Poll).is_some());
        assert!(gate.request(&convo, Trigger::Poll).is_some());
        gate.forget(&contacts());
        assert!(gate.request(&contacts(), Trigger::Hint).is_some());
        assert!(gate.is_in_flight(&convo));
    }

    #[test]
    fn finish_from_a_forgotten_fetch_keeps_the_newer_one() {
        let mut gate = ResyncGate::new();
        let old = gate.request(&contacts(), Trigger::Hint).unwrap();
        gate.forget(&contacts());
        let current = gate.request(&contacts(), Trigger::Hint).unwrap();

        assert_eq!(gate.finish(&contacts(), old), Finished::Stale);
        assert!(gate.is_in_flight(&contacts()));
        assert_eq!(gate.request(&contacts(), Trigger::Poll), None);
        assert_eq!(gate.finish(&contacts(), current), Finished::Done);
    }
}
