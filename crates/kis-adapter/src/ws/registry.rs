/*
[INPUT]:  Subscribe/release calls from tickets, control-channel confirmations
[OUTPUT]: Which frames to send, per-channel state and refcounts, handlers to notify
[POS]:    WebSocket layer - reference-counted subscription bookkeeping (no I/O)
[UPDATE]: When subscription lifecycle rules change
*/

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::http::{KisError, Result};
use crate::types::{SubscriptionState, TransactionRequest};

/// Result of adding a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub ticket_id: u64,
    /// First reference: a SUBSCRIBE frame must go out.
    pub send_subscribe: bool,
}

/// Result of dropping a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Ticket unknown or already released.
    NotFound,
    /// Other references remain.
    Decremented { remaining: usize },
    /// Last reference: an UNSUBSCRIBE frame must go out.
    LastReference,
}

#[derive(Debug)]
struct Entry<H> {
    state: SubscriptionState,
    handlers: Vec<(u64, H)>,
}

/// Desired subscriptions with their tickets. A TR is "desired" while it has at
/// least one outstanding ticket; the desired set survives reconnects.
#[derive(Debug)]
pub struct SubscriptionRegistry<H> {
    max_subscriptions: usize,
    entries: BTreeMap<TransactionRequest, Entry<H>>,
    /// UNSUBSCRIBE sent, confirmation not yet seen.
    unsubscribing: BTreeSet<TransactionRequest>,
    next_ticket_id: u64,
}

impl<H: Clone> SubscriptionRegistry<H> {
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            max_subscriptions,
            entries: BTreeMap::new(),
            unsubscribing: BTreeSet::new(),
            next_ticket_id: 1,
        }
    }

    pub fn max_subscriptions(&self) -> usize {
        self.max_subscriptions
    }

    /// Add a reference to `tr`. Only the first reference asks for a SUBSCRIBE.
    pub fn subscribe(&mut self, tr: TransactionRequest, handler: H) -> Result<SubscribeOutcome> {
        let ticket_id = self.next_ticket_id;

        if let Some(entry) = self.entries.get_mut(&tr) {
            self.next_ticket_id += 1;
            entry.handlers.push((ticket_id, handler));
            return Ok(SubscribeOutcome {
                ticket_id,
                send_subscribe: false,
            });
        }

        if self.entries.len() >= self.max_subscriptions {
            return Err(KisError::SubscriptionLimit {
                limit: self.max_subscriptions,
            });
        }

        self.next_ticket_id += 1;
        self.unsubscribing.remove(&tr);
        self.entries.insert(
            tr,
            Entry {
                state: SubscriptionState::PendingSubscribe,
                handlers: vec![(ticket_id, handler)],
            },
        );
        Ok(SubscribeOutcome {
            ticket_id,
            send_subscribe: true,
        })
    }

    /// Drop the reference held by `ticket_id`. Repeat calls are no-ops.
    pub fn release(&mut self, tr: &TransactionRequest, ticket_id: u64) -> ReleaseOutcome {
        let Some(entry) = self.entries.get_mut(tr) else {
            return ReleaseOutcome::NotFound;
        };
        let Some(position) = entry.handlers.iter().position(|(id, _)| *id == ticket_id) else {
            return ReleaseOutcome::NotFound;
        };

        entry.handlers.remove(position);
        if !entry.handlers.is_empty() {
            return ReleaseOutcome::Decremented {
                remaining: entry.handlers.len(),
            };
        }

        self.entries.remove(tr);
        self.unsubscribing.insert(tr.clone());
        ReleaseOutcome::LastReference
    }

    /// Server approved a SUBSCRIBE. Returns false when nothing was pending.
    pub fn confirm_subscribed(&mut self, tr: &TransactionRequest) -> bool {
        match self.entries.get_mut(tr) {
            Some(entry) if entry.state == SubscriptionState::PendingSubscribe => {
                entry.state = SubscriptionState::Subscribed;
                true
            }
            _ => {
                debug!(%tr, "ignoring unexpected subscribe confirmation");
                false
            }
        }
    }

    /// Server acknowledged an UNSUBSCRIBE. Returns false when nothing was pending.
    pub fn confirm_unsubscribed(&mut self, tr: &TransactionRequest) -> bool {
        if self.unsubscribing.remove(tr) {
            return true;
        }
        debug!(%tr, "ignoring unexpected unsubscribe confirmation");
        false
    }

    /// Server refused a request for `tr`. A refused SUBSCRIBE stays desired and
    /// is tried again on the next session.
    pub fn reject(&mut self, tr: &TransactionRequest) -> bool {
        if let Some(entry) = self.entries.get_mut(tr)
            && entry.state == SubscriptionState::PendingSubscribe
        {
            entry.state = SubscriptionState::Unsubscribed;
            return true;
        }
        self.unsubscribing.remove(tr)
    }

    /// New session: every desired TR goes back to pending and is returned for replay.
    pub fn reset_session(&mut self) -> Vec<TransactionRequest> {
        self.unsubscribing.clear();
        self.entries
            .iter_mut()
            .map(|(tr, entry)| {
                entry.state = SubscriptionState::PendingSubscribe;
                tr.clone()
            })
            .collect()
    }

    /// Session lost: nothing is live on the server any more.
    pub fn on_disconnect(&mut self) {
        self.unsubscribing.clear();
        for entry in self.entries.values_mut() {
            entry.state = SubscriptionState::Unsubscribed;
        }
    }

    pub fn state(&self, tr: &TransactionRequest) -> SubscriptionState {
        if let Some(entry) = self.entries.get(tr) {
            return entry.state;
        }
        if self.unsubscribing.contains(tr) {
            return SubscriptionState::PendingUnsubscribe;
        }
        SubscriptionState::Unsubscribed
    }

    pub fn refcount(&self, tr: &TransactionRequest) -> usize {
        self.entries
            .get(tr)
            .map(|entry| entry.handlers.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, tr: &TransactionRequest) -> bool {
        self.entries.contains_key(tr)
    }

    pub fn desired(&self) -> Vec<TransactionRequest> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handlers_for(&self, tr: &TransactionRequest) -> Vec<H> {
        self.entries
            .get(tr)
            .map(|entry| entry.handlers.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Handlers of every desired TR whose id is `tr_id`, paired with that TR.
    pub fn handlers_for_id(&self, tr_id: &str) -> Vec<(TransactionRequest, H)> {
        self.entries
            .iter()
            .filter(|(tr, _)| tr.id == tr_id)
            .flat_map(|(tr, entry)| {
                entry
                    .handlers
                    .iter()
                    .map(move |(_, handler)| (tr.clone(), handler.clone()))
            })
            .collect()
    }
}
