//! Per-container listener registry
//!
//! Two registries live side by side:
//!
//! - **durable**: interests registered with [`ListenerRegistry::add_listener`];
//!   they persist until explicitly removed.
//! - **temporary**: interests registered by the lifecycle controller for
//!   the duration of a single call.
//!
//! A listener watching an operation in both registries is delivered each
//! event once. The registry never calls listeners itself; it only computes
//! recipients so the owning container can deliver outside its lock.

use std::collections::HashSet;

use super::operation::{same_listener, ListenerHandle, Operation};

struct Interest {
    listener: ListenerHandle,
    operations: HashSet<Operation>,
}

fn position(entries: &[Interest], listener: &ListenerHandle) -> Option<usize> {
    entries
        .iter()
        .position(|entry| same_listener(&entry.listener, listener))
}

fn watches(entries: &[Interest], listener: &ListenerHandle, operation: Operation) -> bool {
    position(entries, listener)
        .map(|i| entries[i].operations.contains(&operation))
        .unwrap_or(false)
}

fn insert(entries: &mut Vec<Interest>, listener: &ListenerHandle, operation: Operation) {
    match position(entries, listener) {
        Some(i) => {
            entries[i].operations.insert(operation);
        }
        None => entries.push(Interest {
            listener: ListenerHandle::clone(listener),
            operations: HashSet::from([operation]),
        }),
    }
}

/// Removes one interest; drops the entry when its interest set empties
fn remove(entries: &mut Vec<Interest>, listener: &ListenerHandle, operation: Operation) {
    if let Some(i) = position(entries, listener) {
        entries[i].operations.remove(&operation);
        if entries[i].operations.is_empty() {
            entries.remove(i);
        }
    }
}

/// Durable and temporary listener interests of one container
#[derive(Default)]
pub struct ListenerRegistry {
    durable: Vec<Interest>,
    temporary: Vec<Interest>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers durable interest, promoting a matching temporary interest
    pub fn add_listener(&mut self, listener: &ListenerHandle, operation: Operation) {
        insert(&mut self.durable, listener, operation);

        if watches(&self.temporary, listener, operation) {
            remove(&mut self.temporary, listener, operation);
        }
    }

    /// Registers call-scoped interest for listeners not already durably watching
    pub fn add_temporary_listeners(&mut self, operation: Operation, listeners: &[ListenerHandle]) {
        for listener in listeners {
            if !watches(&self.durable, listener, operation) {
                insert(&mut self.temporary, listener, operation);
            }
        }
    }

    /// Removes one durable interest, or every interest when `operation` is `None`
    pub fn remove_listener(&mut self, listener: &ListenerHandle, operation: Option<Operation>) {
        match operation {
            Some(operation) => remove(&mut self.durable, listener, operation),
            None => {
                if let Some(i) = position(&self.durable, listener) {
                    self.durable.remove(i);
                }
            }
        }
    }

    /// Drops the call-scoped interest of `listeners` in `operation`
    ///
    /// Listeners promoted to durable during the call are left untouched.
    pub fn remove_temporary_listeners(&mut self, operation: Operation, listeners: &[ListenerHandle]) {
        for listener in listeners {
            remove(&mut self.temporary, listener, operation);
        }
    }

    /// Removes `operation` from every durable listener
    pub fn clear_operation(&mut self, operation: Operation) {
        for entry in &mut self.durable {
            entry.operations.remove(&operation);
        }
        self.durable.retain(|entry| !entry.operations.is_empty());
    }

    /// Removes every durable and temporary interest
    pub fn clear(&mut self) {
        self.durable.clear();
        self.temporary.clear();
    }

    /// Listeners that must receive an event for `operation`, each exactly once
    pub fn recipients(&self, operation: Operation) -> Vec<ListenerHandle> {
        let durable = self
            .durable
            .iter()
            .filter(|entry| entry.operations.contains(&operation))
            .map(|entry| ListenerHandle::clone(&entry.listener));

        let temporary = self
            .temporary
            .iter()
            .filter(|entry| entry.operations.contains(&operation))
            .filter(|entry| !watches(&self.durable, &entry.listener, operation))
            .map(|entry| ListenerHandle::clone(&entry.listener));

        durable.chain(temporary).collect()
    }

    /// True if `listener` has a durable interest in `operation`
    pub fn is_watching(&self, listener: &ListenerHandle, operation: Operation) -> bool {
        watches(&self.durable, listener, operation)
    }

    /// True if `listener` has a call-scoped interest in `operation`
    pub fn is_temporarily_watching(&self, listener: &ListenerHandle, operation: Operation) -> bool {
        watches(&self.temporary, listener, operation)
    }

    /// True if `listener` has any durable entry at all
    pub fn contains(&self, listener: &ListenerHandle) -> bool {
        position(&self.durable, listener).is_some()
    }

    /// Number of durable listener entries
    pub fn len(&self) -> usize {
        self.durable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durable.is_empty() && self.temporary.is_empty()
    }
}
