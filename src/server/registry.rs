//! Method table.
//!
//! Maps `(category, method)` to the handlers registered for it. Rows are
//! created by the first registration of a path; later registrations of the
//! same path attach more handlers to the existing row.

use super::handler::BoxedHandler;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Split a registration path into `(category, method)`.
///
/// - `"bar"` → `("/", "bar")`
/// - `"foo/bar"` and `"/foo/bar"` → `("/foo", "bar")`
pub(crate) fn split_path(path: &str) -> (String, String) {
    // ---
    let (category, method) = match path.rsplit_once('/') {
        Some((category, method)) => (category, method),
        None => ("", path),
    };

    let category = if category.is_empty() {
        "/".to_string()
    } else if category.starts_with('/') {
        category.to_string()
    } else {
        log_warn!("method category {category} should start with '/', adding one");
        format!("/{category}")
    };

    (category, method.to_string())
}

/// One registered method.
#[derive(Clone)]
pub(crate) struct MethodEntry {
    // ---
    pub name: String,
    pub description: Option<Value>,
    pub request: Vec<BoxedHandler>,
    pub cancel: Vec<BoxedHandler>,
    pub private_bus_only: bool,
}

impl MethodEntry {
    pub fn has_cancel_handler(&self) -> bool {
        !self.cancel.is_empty()
    }
}

/// Registered methods by category and name.
#[derive(Default)]
pub(crate) struct MethodRegistry {
    // ---
    methods: BTreeMap<String, BTreeMap<String, MethodEntry>>,
}

impl MethodRegistry {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    /// Add or extend the row for `category`/`method`.
    ///
    /// `private_bus_only` is only set on creation; a row that was exposed on
    /// the general-access bus once stays public.
    pub fn register(
        &mut self,
        category: &str,
        method: &str,
        request: Option<BoxedHandler>,
        cancel: Option<BoxedHandler>,
        description: Option<Value>,
        private_bus_only: bool,
    ) {
        // ---
        let entry = self
            .methods
            .entry(category.to_string())
            .or_default()
            .entry(method.to_string())
            .or_insert_with(|| MethodEntry {
                name: method.to_string(),
                description: description.clone(),
                request: Vec::new(),
                cancel: Vec::new(),
                private_bus_only,
            });

        if !private_bus_only {
            entry.private_bus_only = false;
        }
        if entry.description.is_none() {
            entry.description = description;
        }
        entry.request.extend(request);
        entry.cancel.extend(cancel);
    }

    /// Snapshot of a row, for invoking its handlers without holding the
    /// registry.
    pub fn lookup(&self, category: &str, method: &str) -> Option<MethodEntry> {
        self.methods.get(category)?.get(method).cloned()
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.methods.contains_key(category)
    }

    /// `info` listing: `"<category>/<method>"` → description (or `{}`).
    pub fn describe(&self, include_private: bool) -> Map<String, Value> {
        // ---
        let mut commands = Map::new();
        for (category, methods) in &self.methods {
            for (name, entry) in methods {
                if entry.private_bus_only && !include_private {
                    continue;
                }
                let description = entry
                    .description
                    .clone()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                commands.insert(join_path(category, name), description);
            }
        }
        commands
    }
}

fn join_path(category: &str, method: &str) -> String {
    // ---
    if category.ends_with('/') {
        format!("{category}{method}")
    } else {
        format!("{category}/{method}")
    }
}
