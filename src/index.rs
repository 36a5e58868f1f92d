// nc_doc_loader/src/index.rs
// Post-load index maintenance.

use mongodb::bson::Document;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{IngestorError, Result};
use crate::ingestor::DocumentStore;

/// Index definition as written in the pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize,)]
pub struct IndexConfig {
    /// `path:direction` pairs, e.g. `customer.id:1,created:-1`.
    pub fields: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    /// Drop the index instead of creating it.
    #[serde(default)]
    pub drop:   bool,
}

#[derive(Debug, Clone, PartialEq, Eq,)]
pub struct IndexSpec {
    pub fields: Vec<(String, i32,),>,
    pub unique: bool,
    pub sparse: bool,
    pub drop:   bool,
}

impl IndexSpec {
    pub fn from_config(config: &IndexConfig,) -> Result<Self,> {
        let fields = parse_index_fields(&config.fields,)?;
        Ok(Self {
            fields,
            unique: config.unique,
            sparse: config.sparse,
            drop: config.drop,
        },)
    }

    pub fn keys(&self,) -> Document {
        let mut keys = Document::new();
        for (path, direction,) in &self.fields {
            keys.insert(path.clone(), *direction,);
        }
        keys
    }

    /// Default store naming: `path_dir` pairs joined by `_`.
    pub fn name(&self,) -> String {
        self.fields
            .iter()
            .map(|(path, direction,)| format!("{path}_{direction}"),)
            .collect::<Vec<_,>>()
            .join("_",)
    }

    fn validate(&self,) -> Result<(),> {
        if self.sparse && self.fields.len() > 1 {
            return Err(IngestorError::ConfigurationError(format!(
                "sparse index '{}' names {} fields; sparse indexes are limited to one field",
                self.name(),
                self.fields.len()
            ),),);
        }
        Ok((),)
    }
}

fn parse_index_fields(raw: &str,) -> Result<Vec<(String, i32,),>,> {
    let mut fields = Vec::new();
    for part in raw.split(',',).map(str::trim,).filter(|p| !p.is_empty(),) {
        let (path, direction,) = match part.rsplit_once(':',) {
            Some((path, dir,),) => {
                let direction = match dir.trim() {
                    "1" => 1,
                    "-1" => -1,
                    other => {
                        return Err(IngestorError::ConfigurationError(format!(
                            "index direction for '{}' must be 1 or -1, got '{}'",
                            path, other
                        ),),);
                    },
                };
                (path.trim(), direction,)
            },
            None => (part, 1,),
        };
        if path.is_empty() {
            return Err(IngestorError::ConfigurationError(format!(
                "index entry '{}' has no field path",
                part
            ),),);
        }
        fields.push((path.to_string(), direction,),);
    }
    if fields.is_empty() {
        return Err(IngestorError::ConfigurationError(
            "index definition names no fields".to_string(),
        ),);
    }
    Ok(fields,)
}

/// Applies configured indexes once the row stream has been written.
pub struct IndexManager;

impl IndexManager {
    /// Every spec is validated before the first index call is issued. Indexes
    /// are built in the background. Drop requests are moot after a truncate.
    pub async fn apply_indexes<S: DocumentStore + ?Sized,>(
        store: &S,
        specs: &[IndexSpec],
        truncated: bool,
    ) -> Result<usize,> {
        for spec in specs {
            spec.validate()?;
        }
        if specs.is_empty() {
            return Ok(0,);
        }

        info!("Applying {} index operation(s)", specs.len());
        let mut applied = 0;
        for spec in specs {
            if spec.drop {
                if truncated {
                    debug!("Collection was truncated; index '{}' is already gone", spec.name());
                    continue;
                }
                info!("Dropping index '{}'", spec.name());
                store.drop_index(spec,).await?;
            } else {
                info!(
                    "Creating {}{}index '{}'",
                    if spec.unique { "unique " } else { "" },
                    if spec.sparse { "sparse " } else { "" },
                    spec.name()
                );
                store.create_index(spec, true,).await?;
            }
            applied += 1;
        }
        Ok(applied,)
    }
}
