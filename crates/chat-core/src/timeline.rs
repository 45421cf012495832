use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::{
    normalization::{IdentityCache, NormalizedBatch},
    types::{ConversationId, NormalizedMessage},
};

/// Errors that can occur while merging into a conversation log.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineMergeError {
    /// A message belongs to a different conversation than the log.
    #[error("message '{message_id}' belongs to '{found}', not '{expected}'")]
    ConversationMismatch {
        message_id: String,
        expected: ConversationId,
        found: ConversationId,
    },
}

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub edited: usize,
    pub removed: usize,
    pub trimmed: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.edited + self.removed + self.trimmed > 0
    }
}

/// Ordered message log of one conversation.
///
/// Messages are kept sorted ascending by `created_at`; ties keep arrival
/// order. Ids are unique. Without a cap the log only shrinks through
/// redactions.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTimeline {
    conversation_id: ConversationId,
    items: Vec<NormalizedMessage>,
    max_items: Option<usize>,
}

impl ConversationTimeline {
    /// Create an empty log, optionally keeping only the newest `max_items`.
    pub fn new(conversation_id: impl Into<ConversationId>, max_items: Option<usize>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            items: Vec::new(),
            max_items: max_items.map(|max| max.max(1)),
        }
    }

    /// Rebuild a log from persisted items, re-establishing its invariants.
    pub fn from_items(
        conversation_id: impl Into<ConversationId>,
        items: Vec<NormalizedMessage>,
        max_items: Option<usize>,
    ) -> Result<Self, TimelineMergeError> {
        let mut timeline = Self::new(conversation_id, max_items);
        timeline.merge(&NormalizedBatch {
            messages: items,
            ..NormalizedBatch::default()
        })?;
        Ok(timeline)
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Current messages in display order.
    pub fn items(&self) -> &[NormalizedMessage] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Newest message, if any.
    pub fn latest(&self) -> Option<&NormalizedMessage> {
        self.items.last()
    }

    pub fn find(&self, id: &str) -> Option<&NormalizedMessage> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Fold a normalized batch into the log.
    ///
    /// Upserts run first (incoming fields win, except that a placeholder
    /// author never replaces a resolved one), then edits, then redactions.
    /// Applying the same batch twice leaves the log unchanged.
    pub fn merge(&mut self, batch: &NormalizedBatch) -> Result<MergeOutcome, TimelineMergeError> {
        check_conversation(&self.conversation_id, batch)?;

        let mut outcome = MergeOutcome::default();
        let mut fresh = HashSet::new();
        let mut index: HashMap<String, usize> = self
            .items
            .iter()
            .enumerate()
            .map(|(position, item)| (item.id.clone(), position))
            .collect();

        for incoming in collapse_upserts(batch) {
            match index.get(&incoming.id) {
                Some(&position) => {
                    let existing = &mut self.items[position];
                    let merged = keep_resolved_author(existing, incoming);
                    if *existing != merged {
                        *existing = merged;
                        outcome.updated += 1;
                    }
                }
                None => {
                    index.insert(incoming.id.clone(), self.items.len());
                    fresh.insert(incoming.id.clone());
                    self.items.push(incoming);
                    outcome.inserted += 1;
                }
            }
        }

        for edit in &batch.edits {
            if let Some(&position) = index.get(&edit.target_id) {
                let target = &mut self.items[position];
                if target.content != edit.new_content {
                    target.content = edit.new_content.clone();
                    outcome.edited += 1;
                }
            }
        }

        if !batch.redactions.is_empty() {
            let mut retracted = 0;
            let mut removed = 0;
            self.items.retain(|item| {
                if !batch.redactions.contains(&item.id) {
                    return true;
                }
                if fresh.contains(&item.id) {
                    retracted += 1;
                } else {
                    removed += 1;
                }
                false
            });
            outcome.inserted -= retracted;
            outcome.removed = removed;
        }

        self.items.sort_by_key(|item| item.created_at);
        for dropped in self.trim_to_max(&fresh) {
            // Re-delivered history that falls below the cap is not a change.
            if fresh.contains(&dropped.id) {
                outcome.inserted -= 1;
            } else {
                outcome.trimmed += 1;
            }
        }
        Ok(outcome)
    }

    /// Replace placeholder authors with cache entries; returns patched count.
    pub fn patch_authors(&mut self, identities: &IdentityCache) -> usize {
        let mut patched = 0;
        for item in self.items.iter_mut().filter(|item| !item.author.resolved) {
            if let Some(author) = identities.get(&item.created_by) {
                item.author = author.clone();
                patched += 1;
            }
        }
        patched
    }

    /// Clamp a requested page size against safety and server caps.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_paginate_limit(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(100)
    }

    /// Drop the oldest messages above the cap. At equal timestamps messages
    /// new to this merge go first, so re-merging a batch trims the same set.
    fn trim_to_max(&mut self, fresh: &HashSet<String>) -> Vec<NormalizedMessage> {
        let Some(max_items) = self.max_items else {
            return Vec::new();
        };
        if self.items.len() <= max_items {
            return Vec::new();
        }

        let excess = self.items.len() - max_items;
        let mut by_age: Vec<usize> = (0..self.items.len()).collect();
        by_age.sort_by_key(|&position| {
            let item = &self.items[position];
            (item.created_at, !fresh.contains(&item.id))
        });
        let doomed: HashSet<usize> = by_age.into_iter().take(excess).collect();

        let mut dropped = Vec::with_capacity(excess);
        let mut position = 0;
        self.items.retain(|item| {
            let keep = !doomed.contains(&position);
            position += 1;
            if !keep {
                dropped.push(item.clone());
            }
            keep
        });
        dropped
    }
}

/// One upsert per id, at its first arrival position with its last values
/// and the batch's own edits already applied.
fn collapse_upserts(batch: &NormalizedBatch) -> Vec<NormalizedMessage> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut upserts: Vec<NormalizedMessage> = Vec::with_capacity(batch.messages.len());
    for incoming in &batch.messages {
        match positions.get(incoming.id.as_str()) {
            Some(&position) => {
                let merged = keep_resolved_author(&upserts[position], incoming.clone());
                upserts[position] = merged;
            }
            None => {
                positions.insert(&incoming.id, upserts.len());
                upserts.push(incoming.clone());
            }
        }
    }
    for edit in &batch.edits {
        if let Some(&position) = positions.get(edit.target_id.as_str()) {
            upserts[position].content = edit.new_content.clone();
        }
    }
    upserts
}

/// Incoming fields win, except that a placeholder never replaces a resolved author.
fn keep_resolved_author(
    existing: &NormalizedMessage,
    mut incoming: NormalizedMessage,
) -> NormalizedMessage {
    if existing.author.resolved && !incoming.author.resolved {
        incoming.author = existing.author.clone();
    }
    incoming
}

/// Reject batches carrying messages of another conversation.
pub(crate) fn check_conversation(
    conversation_id: &str,
    batch: &NormalizedBatch,
) -> Result<(), TimelineMergeError> {
    match batch
        .messages
        .iter()
        .find(|message| message.conversation_id != conversation_id)
    {
        Some(foreign) => Err(TimelineMergeError::ConversationMismatch {
            message_id: foreign.id.clone(),
            expected: conversation_id.to_owned(),
            found: foreign.conversation_id.clone(),
        }),
        None => Ok(()),
    }
}
