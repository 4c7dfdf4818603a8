//! Model registry for successful pipeline runs.
//!
//! Each success is stored under its own run id:
//!
//! ```text
//! <models_dir>/<run_id>/metadata.json
//! <models_dir>/<run_id>/<model artifact>
//! ```
//!
//! The registry is append-only; deletion is the only mutation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::adapter::AlgorithmType;
use crate::error::RegistryError;
use crate::report::ExecutionReport;

/// Name of the per-run metadata file.
const METADATA_FILENAME: &str = "metadata.json";

/// Metadata persisted for one successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub model_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<AlgorithmType>,
    #[serde(default)]
    pub target: Option<String>,
    pub metrics: BTreeMap<String, f64>,
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shap_importance: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    /// Attempts the run needed to succeed.
    #[serde(default)]
    pub attempts: u32,
}

impl ModelRecord {
    /// Builds a record with a fresh run id from a successful report.
    pub fn from_report(report: &ExecutionReport, algorithm: Option<AlgorithmType>, attempts: u32) -> Self {
        let timestamp = Utc::now();
        Self {
            run_id: generate_run_id(timestamp),
            timestamp,
            model_type: report.model_type.clone(),
            algorithm,
            target: report.target.clone(),
            metrics: report.metrics.clone(),
            features: report.features.clone(),
            shap_importance: report.shap_importance.clone(),
            model_path: report.model_path.clone(),
            attempts,
        }
    }
}

/// Generates a unique, sortable run id.
pub fn generate_run_id(timestamp: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("run_{}_{}", timestamp.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

/// Validates that a run id is safe to use as a directory name.
pub fn validate_run_id(run_id: &str) -> Result<(), RegistryError> {
    let valid = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidRunId(run_id.to_string()))
    }
}

/// Storage for successful runs.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Stores a record. Returns the record as stored.
    async fn record(&self, record: ModelRecord) -> Result<ModelRecord, RegistryError>;

    /// Lists all records, newest first.
    async fn list(&self) -> Result<Vec<ModelRecord>, RegistryError>;

    /// Returns one record.
    async fn get(&self, run_id: &str) -> Result<ModelRecord, RegistryError>;

    /// Deletes a run and its artifacts.
    async fn delete(&self, run_id: &str) -> Result<(), RegistryError>;
}

/// Filesystem-backed registry.
#[derive(Debug, Clone)]
pub struct FsModelRegistry {
    root: PathBuf,
}

impl FsModelRegistry {
    /// Create a registry rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Registry root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    async fn read_metadata(path: &Path) -> Result<ModelRecord, RegistryError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[async_trait]
impl ModelRegistry for FsModelRegistry {
    async fn record(&self, mut record: ModelRecord) -> Result<ModelRecord, RegistryError> {
        validate_run_id(&record.run_id)?;

        let dir = self.run_dir(&record.run_id);
        if tokio::fs::try_exists(&dir).await? {
            return Err(RegistryError::DuplicateRun(record.run_id));
        }
        tokio::fs::create_dir_all(&dir).await?;

        // Copy the artifact out of the attempt workspace so it survives cleanup.
        if let Some(model_path) = record.model_path.clone() {
            let source = PathBuf::from(&model_path);
            let is_file = tokio::fs::metadata(&source)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            match source.file_name() {
                Some(name) if is_file => {
                    let dest = dir.join(name);
                    tokio::fs::copy(&source, &dest).await?;
                    record.model_path = Some(dest.to_string_lossy().into_owned());
                }
                _ => {
                    tracing::warn!(
                        run_id = %record.run_id,
                        model_path = %model_path,
                        "Model artifact not found, keeping reported path"
                    );
                }
            }
        }

        let contents = serde_json::to_string_pretty(&record)?;
        tokio::fs::write(dir.join(METADATA_FILENAME), contents).await?;

        tracing::info!(
            run_id = %record.run_id,
            model_type = %record.model_type,
            "Recorded model run"
        );
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<ModelRecord>, RegistryError> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path().join(METADATA_FILENAME);
            if !tokio::fs::try_exists(&path).await? {
                continue;
            }
            match Self::read_metadata(&path).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable metadata");
                }
            }
        }

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.run_id.cmp(&a.run_id)));
        Ok(records)
    }

    async fn get(&self, run_id: &str) -> Result<ModelRecord, RegistryError> {
        validate_run_id(run_id)?;

        let dir = self.run_dir(run_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(RegistryError::RunNotFound(run_id.to_string()));
        }
        let path = dir.join(METADATA_FILENAME);
        if !tokio::fs::try_exists(&path).await? {
            return Err(RegistryError::MetadataMissing(run_id.to_string()));
        }
        Self::read_metadata(&path).await
    }

    async fn delete(&self, run_id: &str) -> Result<(), RegistryError> {
        validate_run_id(run_id)?;

        let dir = self.run_dir(run_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(RegistryError::RunNotFound(run_id.to_string()));
        }
        tokio::fs::remove_dir_all(&dir).await?;
        tracing::info!(run_id = %run_id, "Deleted model run");
        Ok(())
    }
}
