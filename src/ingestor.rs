// nc_doc_loader/src/ingestor.rs
// Pipeline configuration and the document store seam.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::{IngestorError, Result};
use crate::index::{IndexConfig, IndexSpec};
use crate::mapping::{FieldMapping, PathSpec};
use crate::retry::RetrySettings;

fn default_batch_size() -> usize {
    crate::DEFAULT_BATCH_SIZE
}

fn default_write_retries() -> u32 {
    crate::DEFAULT_WRITE_RETRIES
}

fn default_write_retry_delay() -> u64 {
    crate::DEFAULT_WRITE_RETRY_DELAY_SECS
}

/// Configuration for one loading pipeline.
///
/// Values arrive already substituted; nothing here expands placeholders.
#[derive(Debug, Clone, Serialize, Deserialize,)]
pub struct IngestorConfig {
    #[serde(default)]
    pub database:               String,
    #[serde(default)]
    pub collection:             String,
    #[serde(default = "default_batch_size")]
    pub batch_size:             usize,
    #[serde(default = "default_write_retries")]
    pub write_retries:          u32,
    #[serde(default = "default_write_retry_delay")]
    pub write_retry_delay_secs: u64,
    /// Drop and recreate the collection before the first write.
    #[serde(default)]
    pub truncate:               bool,
    #[serde(default)]
    pub upsert:                 bool,
    /// Upsert with partial field updates instead of full replacement.
    #[serde(default)]
    pub modifier_update:        bool,
    /// Apply an upsert to every matching document rather than the first.
    #[serde(default)]
    pub multi:                  bool,
    #[serde(default)]
    pub fields:                 Vec<FieldMapping,>,
    #[serde(default)]
    pub indexes:                Vec<IndexConfig,>,
}

impl IngestorConfig {
    pub fn from_path(path: &Path,) -> Result<Self,> {
        let raw = std::fs::read_to_string(path,)?;
        serde_json::from_str(&raw,).map_err(|e| {
            IngestorError::ConfigurationError(format!(
                "Failed to parse pipeline configuration {}: {}",
                path.display(),
                e
            ),)
        },)
    }

    pub fn validate(&self,) -> Result<(),> {
        if self.database.trim().is_empty() {
            return Err(IngestorError::ConfigurationError(
                "no database specified".to_string(),
            ),);
        }
        if self.collection.trim().is_empty() {
            return Err(IngestorError::ConfigurationError(
                "no collection specified".to_string(),
            ),);
        }
        if self.batch_size == 0 {
            return Err(IngestorError::ConfigurationError(
                "batch size must be at least 1".to_string(),
            ),);
        }
        if self.fields.is_empty() {
            return Err(IngestorError::ConfigurationError(
                "no field mappings configured".to_string(),
            ),);
        }
        if self.upsert && self.multi && !self.modifier_update {
            return Err(IngestorError::ConfigurationError(
                "multi-document updates require modifier updates; a replacement document can \
                 only apply to one match"
                    .to_string(),
            ),);
        }
        if self.upsert && !self.fields.iter().any(|f| f.match_key,) {
            return Err(IngestorError::ConfigurationError(
                "upsert requires at least one match key field".to_string(),
            ),);
        }
        Ok((),)
    }

    pub fn retry_settings(&self,) -> RetrySettings {
        RetrySettings {
            max_retries: self.write_retries,
            delay:       Duration::from_secs(self.write_retry_delay_secs,),
        }
    }

    pub fn path_specs(&self,) -> Result<Vec<PathSpec,>,> {
        self.fields.iter().map(PathSpec::from_mapping,).collect()
    }

    pub fn index_specs(&self,) -> Result<Vec<IndexSpec,>,> {
        self.indexes.iter().map(IndexSpec::from_config,).collect()
    }
}

/// Result of one write attempt as reported by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq,)]
pub struct WriteOutcome {
    pub ok:            bool,
    pub error_message: Option<String,>,
    /// Server that handled the write, when the store reports it.
    pub server:        Option<String,>,
}

impl WriteOutcome {
    pub fn acknowledged() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String,>,) -> Self {
        Self {
            ok: false,
            error_message: Some(message.into(),),
            server: None,
        }
    }

    pub fn with_server(mut self, server: impl Into<String,>,) -> Self {
        self.server = Some(server.into(),);
        self
    }
}

/// Second half of an upsert: a whole replacement or a set of field operators.
#[derive(Debug, Clone, PartialEq,)]
pub enum UpdateDocument {
    Replacement(Bson,),
    Modifiers(Document,),
}

/// Collection handle the pipeline writes through.
///
/// One handle is owned by exactly one pipeline instance.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_many(&self, documents: &[Bson],) -> Result<WriteOutcome,>;

    async fn update(
        &self,
        query: &Document,
        update: &UpdateDocument,
        upsert: bool,
        multi: bool,
    ) -> Result<WriteOutcome,>;

    async fn drop_collection(&self,) -> Result<(),>;

    /// Creates the collection when it does not exist yet.
    async fn ensure_collection(&self,) -> Result<(),>;

    async fn create_index(&self, index: &IndexSpec, background: bool,) -> Result<(),>;

    async fn drop_index(&self, index: &IndexSpec,) -> Result<(),>;

    /// Releases the underlying connection. Further calls may fail.
    async fn release(&self,) -> Result<(),>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str,) -> IngestorConfig {
        serde_json::from_str(json,).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = config(
            r#"{"database":"db","collection":"c","fields":[{"incoming_field":"a"}]}"#,
        );
        assert_eq!(cfg.batch_size, crate::DEFAULT_BATCH_SIZE);
        assert_eq!(cfg.write_retries, crate::DEFAULT_WRITE_RETRIES);
        assert_eq!(cfg.retry_settings().delay, Duration::from_secs(10));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_missing_names_and_replacement_multi() {
        let no_db = config(r#"{"collection":"c","fields":[{"incoming_field":"a"}]}"#);
        assert!(no_db.validate().unwrap_err().is_configuration());

        let no_coll = config(r#"{"database":"d","fields":[{"incoming_field":"a"}]}"#);
        assert!(no_coll.validate().is_err());

        let multi = config(
            r#"{"database":"d","collection":"c","upsert":true,"multi":true,
                "fields":[{"incoming_field":"a","match_key":true}]}"#,
        );
        assert!(multi.validate().is_err());

        let no_key = config(
            r#"{"database":"d","collection":"c","upsert":true,"fields":[{"incoming_field":"a"}]}"#,
        );
        assert!(no_key.validate().is_err());
    }
}
