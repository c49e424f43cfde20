use crate::{Message, UniqueToken};
use std::collections::HashMap;

/// One live inbound subscription.
#[derive(Debug, Clone)]
pub(crate) struct SubscriptionRow {
    // ---
    pub category: String,
    pub method: String,
    pub message: Message,
}

/// Tracks live inbound subscriptions by token
///
/// A token appears at most once. Removing a row hands it back so the caller
/// can complete its activity and run the method's cancel handlers.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    // ---
    rows: HashMap<UniqueToken, SubscriptionRow>,
}

impl SubscriptionTable {
    // ---

    /// Create a new empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the subscription carried by `message`
    ///
    /// Returns false if the token was already registered; the existing row
    /// is kept.
    pub fn insert(&mut self, message: Message) -> bool {
        // ---
        if self.rows.contains_key(&message.unique_token) {
            return false;
        }
        self.rows.insert(
            message.unique_token.clone(),
            SubscriptionRow {
                category: message.category.clone(),
                method: message.method.clone(),
                message,
            },
        );
        true
    }

    /// Remove and return the row for `token`
    pub fn remove(&mut self, token: &UniqueToken) -> Option<SubscriptionRow> {
        self.rows.remove(token)
    }

    pub fn contains(&self, token: &UniqueToken) -> bool {
        self.rows.contains_key(token)
    }

    /// Get the number of live subscriptions
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Drop every row, returning them
    pub fn drain(&mut self) -> Vec<SubscriptionRow> {
        self.rows.drain().map(|(_, row)| row).collect()
    }
}
