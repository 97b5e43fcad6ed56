// src/lib.rs
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::try_join_all;
use log::{error, warn};
use thiserror::Error;

pub mod flag;
pub mod store;
#[cfg(feature = "rusqlite")]
mod sqlite_tests;

pub use crate::flag::{BulkFailure, BulkOperationResult, Flag, FlagGrant, Subject};
#[cfg(feature = "rusqlite")]
pub use crate::store::SqliteAdapter;
pub use crate::store::{MemoryAdapter, StorageAdapter};

#[derive(Debug, Error)]
pub enum FlagError {
    #[error("flag {0} not found")]
    NotFound(String),

    #[error("flag {0} already exists")]
    Conflict(String),

    #[error("not configured: call configure() before using the flag API")]
    NotConfigured,

    #[error("storage error: {0}")]
    Storage(String),

    #[cfg(feature = "rusqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Entry point bound to one storage adapter. Every operation delegates to
/// the adapter; `evaluate_batch` is the only added logic.
pub struct FlagEvaluator {
    adapter: Arc<dyn StorageAdapter>,
}

impl FlagEvaluator {
    pub fn new<A>(adapter: A) -> Self
    where
        A: StorageAdapter + 'static,
    {
        Self {
            adapter: Arc::new(adapter),
        }
    }

    pub fn with_adapter(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    pub async fn is_enabled(&self, flag_name: &str, subject_id: &str) -> Result<bool, FlagError> {
        self.adapter.is_enabled(flag_name, subject_id).await
    }

    /// Resolves every flag concurrently and returns one entry per distinct
    /// input name; duplicates collapse. Missing flags resolve to `false`,
    /// while any other adapter failure fails the whole call so callers
    /// never see a partial map.
    pub async fn evaluate_batch(
        &self,
        flag_names: &[String],
        subject_id: &str,
    ) -> Result<HashMap<String, bool>, FlagError> {
        let checks = flag_names.iter().map(|flag_name| async move {
            let enabled = self.adapter.is_enabled(flag_name, subject_id).await?;
            Ok::<_, FlagError>((flag_name.clone(), enabled))
        });
        let resolved = try_join_all(checks).await?;
        Ok(resolved.into_iter().collect())
    }

    pub async fn grant_access(&self, flag_name: &str, subject_id: &str) -> Result<(), FlagError> {
        self.adapter.grant_access(flag_name, subject_id).await
    }

    pub async fn revoke_access(&self, flag_name: &str, subject_id: &str) -> Result<(), FlagError> {
        self.adapter.revoke_access(flag_name, subject_id).await
    }

    pub async fn grant_access_bulk(
        &self,
        flag_name: &str,
        subject_ids: &[String],
    ) -> Result<BulkOperationResult, FlagError> {
        self.adapter.grant_access_bulk(flag_name, subject_ids).await
    }

    pub async fn revoke_access_bulk(
        &self,
        flag_name: &str,
        subject_ids: &[String],
    ) -> Result<BulkOperationResult, FlagError> {
        self.adapter
            .revoke_access_bulk(flag_name, subject_ids)
            .await
    }

    pub async fn enable_for_all(&self, flag_name: &str) -> Result<(), FlagError> {
        self.adapter.enable_for_all(flag_name).await
    }

    pub async fn disable_for_all(&self, flag_name: &str) -> Result<(), FlagError> {
        self.adapter.disable_for_all(flag_name).await
    }

    pub async fn get_active_flags(&self, subject_id: &str) -> Result<Vec<Flag>, FlagError> {
        self.adapter.get_active_flags(subject_id).await
    }

    pub async fn create_flag(&self, name: &str) -> Result<Flag, FlagError> {
        self.adapter.create_flag(name).await
    }

    pub async fn delete_flag(&self, name: &str) -> Result<(), FlagError> {
        self.adapter.delete_flag(name).await
    }

    pub async fn list_flags(&self) -> Result<Vec<Flag>, FlagError> {
        self.adapter.list_flags().await
    }

    pub async fn get_flag(&self, name: &str) -> Result<Option<Flag>, FlagError> {
        self.adapter.get_flag(name).await
    }
}

static ACTIVE: RwLock<Option<Arc<FlagEvaluator>>> = RwLock::new(None);

/// Installs the process-wide evaluator. Expected to run once at startup;
/// calling it again replaces the instance, and in-flight operations keep
/// the adapter they already resolved.
pub fn configure<A>(adapter: A)
where
    A: StorageAdapter + 'static,
{
    let mut active = ACTIVE.write().unwrap();
    if active.is_some() {
        warn!("configure() called again; replacing the active evaluator");
    }
    *active = Some(Arc::new(FlagEvaluator::new(adapter)));
}

/// Clears the process-wide binding. Subsequent API calls fail with
/// `NotConfigured` until `configure` runs again.
pub fn reset() {
    let mut active = ACTIVE.write().unwrap();
    *active = None;
}

/// The active evaluator, or `NotConfigured` — never a silent default.
pub fn evaluator() -> Result<Arc<FlagEvaluator>, FlagError> {
    let active = ACTIVE.read().unwrap();
    match active.as_ref() {
        Some(evaluator) => Ok(Arc::clone(evaluator)),
        None => {
            error!("flag API used before configure()");
            Err(FlagError::NotConfigured)
        }
    }
}

pub async fn is_enabled(flag_name: &str, subject_id: &str) -> Result<bool, FlagError> {
    evaluator()?.is_enabled(flag_name, subject_id).await
}

/// Alias for `is_enabled`, for call sites that read as access checks.
pub async fn has_access(flag_name: &str, subject_id: &str) -> Result<bool, FlagError> {
    is_enabled(flag_name, subject_id).await
}

pub async fn evaluate(
    flag_names: &[String],
    subject_id: &str,
) -> Result<HashMap<String, bool>, FlagError> {
    evaluator()?.evaluate_batch(flag_names, subject_id).await
}

pub async fn get_active_flags(subject_id: &str) -> Result<Vec<Flag>, FlagError> {
    evaluator()?.get_active_flags(subject_id).await
}

pub async fn grant_access(flag_name: &str, subject_id: &str) -> Result<(), FlagError> {
    evaluator()?.grant_access(flag_name, subject_id).await
}

pub async fn revoke_access(flag_name: &str, subject_id: &str) -> Result<(), FlagError> {
    evaluator()?.revoke_access(flag_name, subject_id).await
}

pub async fn grant_access_bulk(
    flag_name: &str,
    subject_ids: &[String],
) -> Result<BulkOperationResult, FlagError> {
    evaluator()?.grant_access_bulk(flag_name, subject_ids).await
}

pub async fn revoke_access_bulk(
    flag_name: &str,
    subject_ids: &[String],
) -> Result<BulkOperationResult, FlagError> {
    evaluator()?.revoke_access_bulk(flag_name, subject_ids).await
}

pub async fn enable_for_all(flag_name: &str) -> Result<(), FlagError> {
    evaluator()?.enable_for_all(flag_name).await
}

pub async fn disable_for_all(flag_name: &str) -> Result<(), FlagError> {
    evaluator()?.disable_for_all(flag_name).await
}

pub async fn create_flag(name: &str) -> Result<Flag, FlagError> {
    evaluator()?.create_flag(name).await
}

pub async fn delete_flag(name: &str) -> Result<(), FlagError> {
    evaluator()?.delete_flag(name).await
}

pub async fn list_flags() -> Result<Vec<Flag>, FlagError> {
    evaluator()?.list_flags().await
}

pub async fn get_flag(name: &str) -> Result<Option<Flag>, FlagError> {
    evaluator()?.get_flag(name).await
}
