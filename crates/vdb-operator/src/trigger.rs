//! Triggers carried from the VerticaDB controller to the sandbox controller
//!
//! A trigger is a UUID stored under a per-action annotation of the sandbox
//! config map. Writing a new one overwrites the old one, so there is at most
//! one outstanding trigger per (sandbox, action). The sandbox controller
//! clears a trigger only if the id still matches what it acted on, so a
//! trigger written meanwhile survives.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use vdb_common::crd::VerticaDB;
use vdb_common::Result;

/// Follow-up work the sandbox controller performs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TriggerAction {
    /// Apply the sandbox's password secret
    PasswordChange,
}

impl TriggerAction {
    /// Every action, in the order the sandbox controller handles them
    pub const ALL: [TriggerAction; 1] = [TriggerAction::PasswordChange];

    /// Annotation holding this action's trigger id
    pub fn annotation(self) -> &'static str {
        match self {
            Self::PasswordChange => "vertica.com/sandbox-controller-password-change-trigger-id",
        }
    }

    /// Short name for logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PasswordChange => "password-change",
        }
    }
}

impl std::fmt::Display for TriggerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outstanding request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trigger {
    /// Unique id of this request
    pub id: Uuid,
    /// What to do
    pub action: TriggerAction,
}

impl Trigger {
    /// Fresh trigger with a random id
    pub fn new(action: TriggerAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
        }
    }

    /// Store into annotations, replacing any earlier trigger for the action
    pub fn write(&self, annotations: &mut BTreeMap<String, String>) {
        annotations.insert(self.action.annotation().to_string(), self.id.to_string());
    }

    /// Trigger recorded for `action`, if any
    pub fn read(annotations: &BTreeMap<String, String>, action: TriggerAction) -> Option<Self> {
        let raw = annotations.get(action.annotation())?;
        match Uuid::parse_str(raw) {
            Ok(id) => Some(Self { id, action }),
            Err(e) => {
                warn!(action = %action, value = %raw, error = %e, "ignoring malformed trigger id");
                None
            }
        }
    }

    /// Every recorded trigger
    pub fn pending(annotations: &BTreeMap<String, String>) -> Vec<Self> {
        TriggerAction::ALL
            .iter()
            .filter_map(|a| Self::read(annotations, *a))
            .collect()
    }

    /// Remove this trigger if it is still the recorded one.
    ///
    /// Returns true when the annotation was removed.
    pub fn clear(&self, annotations: &mut BTreeMap<String, String>) -> bool {
        let key = self.action.annotation();
        if annotations.get(key).map(String::as_str) == Some(self.id.to_string().as_str()) {
            annotations.remove(key);
            true
        } else {
            false
        }
    }
}

/// True for annotations the trigger channel manages
pub fn is_trigger_annotation(key: &str) -> bool {
    TriggerAction::ALL.iter().any(|a| a.annotation() == key)
}

/// Producer side of the trigger channel
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TriggerSink: Send + Sync {
    /// Record a new trigger for `action` on the config map of `sandbox`
    async fn fire(&self, vdb: &VerticaDB, sandbox: &str, action: TriggerAction) -> Result<Trigger>;
}
