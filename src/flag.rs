// src/flag.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named boolean feature switch. `name` is the unique lookup key;
/// `enabled_for_all` overrides individual grants when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flag {
    pub id: String,
    pub name: String,
    pub enabled_for_all: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One subject's explicit access record for one flag. At most one grant
/// exists per (flag, subject) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagGrant {
    pub id: String,
    pub flag_id: String,
    pub subject_id: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Caller-side identity being evaluated. Never persisted; only the id
/// appears inside grant records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    /// Optional classification label, e.g. "user" or "account".
    pub kind: Option<String>,
}

impl Subject {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Outcome of a bulk grant/revoke. Every input subject id lands in exactly
/// one of the two lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkOperationResult {
    pub successful: Vec<String>,
    pub failed: Vec<BulkFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkFailure {
    pub subject_id: String,
    pub error: String,
}
