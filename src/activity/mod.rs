//! Activities: keepalive handles backing units of work.
//!
//! An [`Activity`] is issued by the bus-side activity authority (or
//! synthesized locally in dummy mode) and kept live by the
//! [`ActivityManager`] until completed. While at least one activity is live
//! the service's idle timer stays disarmed.

mod manager;

pub use manager::ActivityManager;

use crate::{Error, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};

/// What to create.
#[derive(Debug, Clone)]
pub enum ActivitySpec {
    /// A job name; the manager appends its counter to make the activity name
    /// unique and fills in a default specification.
    Named(String),

    /// A complete authority specification, submitted verbatim.
    Full(Value),
}

impl From<&str> for ActivitySpec {
    fn from(value: &str) -> Self {
        ActivitySpec::Named(value.to_string())
    }
}

impl From<String> for ActivitySpec {
    fn from(value: String) -> Self {
        ActivitySpec::Named(value)
    }
}

impl From<Value> for ActivitySpec {
    fn from(value: Value) -> Self {
        ActivitySpec::Full(value)
    }
}

/// Default specification for a named job.
pub(crate) fn named_spec(name: &str) -> Value {
    json!({
        "activity": {
            "name": name,
            "description": format!("activity created for {name}"),
            "type": {
                "foreground": true,
                "persist": false,
                "explicit": true
            }
        },
        "start": true,
        "replace": true,
        "subscribe": true
    })
}

/// One unit of keepalive-backed work.
///
/// Completion is monotonic: [`mark_completed`](Activity::mark_completed)
/// succeeds once, so an activity shared between a request and its
/// subscription row is released exactly once.
#[derive(Debug)]
pub struct Activity {
    id: String,
    id_value: Value,
    name: String,
    dummy: bool,
    spec: Value,
    completed: AtomicBool,
}

impl Activity {
    pub(crate) fn new(id_value: Value, name: impl Into<String>, dummy: bool, mut spec: Value) -> Self {
        // ---
        let id = id_to_string(&id_value);
        if let Some(obj) = spec.as_object_mut() {
            obj.insert("activityId".to_string(), id_value.clone());
            if dummy {
                obj.insert("isDummyActivity".to_string(), Value::Bool(true));
            }
        }
        Self {
            id,
            id_value,
            name: name.into(),
            dummy,
            spec,
            completed: AtomicBool::new(false),
        }
    }

    /// Build an activity from a reference such as the `$activity` object a
    /// client or the authority attaches to a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `activityId` is missing.
    pub fn from_ref(reference: &Value) -> Result<Self> {
        // ---
        let id_value = reference
            .get("activityId")
            .filter(|v| v.is_string() || v.is_number())
            .cloned()
            .ok_or_else(|| Error::InvalidArgument("activity reference has no activityId".into()))?;

        let name = reference
            .pointer("/activity/name")
            .or_else(|| reference.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let dummy = reference
            .get("isDummyActivity")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self::new(id_value, name, dummy, reference.clone()))
    }

    /// Identifier assigned by the authority, or `dummy_<n>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identifier in the JSON form the authority uses.
    pub fn id_value(&self) -> &Value {
        &self.id_value
    }

    /// Activity name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for locally synthesized activities.
    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    /// True once completed.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Flip to completed. Returns false if it already was.
    pub(crate) fn mark_completed(&self) -> bool {
        !self.completed.swap(true, Ordering::AcqRel)
    }

    /// The specification this activity was created from, with
    /// `activityId` filled in.
    pub fn to_value(&self) -> Value {
        self.spec.clone()
    }
}

fn id_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
