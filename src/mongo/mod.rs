// nc_doc_loader/src/mongo/mod.rs
// MongoDB specific collection handle.

use async_trait::async_trait;
use mongodb::bson::{Bson, Document, doc};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, IndexOptions, InsertManyOptions, ReplaceOptions, UpdateOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{IngestorError, Result};
use crate::index::IndexSpec;
use crate::ingestor::{DocumentStore, UpdateDocument, WriteOutcome};
use crate::retry::{RetrySettings, execute_with_retry};

pub struct MongoCollection {
    client:     Client,
    database:   Database,
    collection: Collection<Document,>,
    name:       String,
}

impl MongoCollection {
    /// Connects and pings the deployment, retrying transient failures.
    pub async fn connect(
        uri: &str,
        database_name: &str,
        collection_name: &str,
        retry: RetrySettings,
    ) -> Result<Self,> {
        if database_name.trim().is_empty() {
            return Err(IngestorError::ConfigurationError("no database specified".to_string(),),);
        }
        if collection_name.trim().is_empty() {
            return Err(IngestorError::ConfigurationError(
                "no collection specified".to_string(),
            ),);
        }

        let client_options = ClientOptions::parse(uri,).await.map_err(|e| {
            IngestorError::ConfigurationError(format!("Failed to parse MongoDB URI: {}", e),)
        },)?;
        if let Some(user,) = client_options
            .credential
            .as_ref()
            .and_then(|c| c.username.as_ref(),)
        {
            info!("Authenticating to MongoDB as '{}'", user);
        }
        let client = Client::with_options(client_options,).map_err(|e| {
            IngestorError::ConnectionError(format!("Failed to create MongoDB client: {}", e),)
        },)?;

        execute_with_retry(retry, &CancellationToken::new(), || async {
            client
                .database("admin",)
                .run_command(doc! {"ping": 1}, None,)
                .await
                .map(|_| (),)
                .map_err(|e| {
                    IngestorError::ConnectionError(format!("Failed to connect to MongoDB: {}", e),)
                },)
        },)
        .await?
        .ok_or(IngestorError::Cancelled,)?;

        let database = client.database(database_name,);
        let collection = database.collection::<Document>(collection_name,);
        let handle = MongoCollection {
            client,
            database,
            collection,
            name: collection_name.to_string(),
        };
        handle.ensure_collection().await?;

        info!(
            "Connected to MongoDB collection '{}' in database '{}'.",
            collection_name, database_name
        );
        Ok(handle,)
    }
}

fn classify(context: &str, e: mongodb::error::Error,) -> IngestorError {
    match *e.kind {
        ErrorKind::Io(_,)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => IngestorError::ConnectionError(format!("{}: {}", context, e),),
        ErrorKind::InvalidArgument { .. }
        | ErrorKind::BsonSerialization(_,)
        | ErrorKind::Authentication { .. } => IngestorError::Other(format!("{}: {}", context, e),),
        _ => IngestorError::DatabaseError(format!("{}: {}", context, e),),
    }
}

/// Server error code for creating a collection that already exists.
const NAMESPACE_EXISTS: i32 = 48;

/// Another pipeline instance created the collection between our listing and
/// our create call.
fn is_namespace_exists(e: &mongodb::error::Error,) -> bool {
    matches!(&*e.kind, ErrorKind::Command(command,) if command.code == NAMESPACE_EXISTS)
}

/// The server only stores documents at the root; a list root is stored keyed
/// by element position.
fn to_root_document(value: &Bson,) -> Result<Document,> {
    match value {
        Bson::Document(doc,) => Ok(doc.clone(),),
        Bson::Array(items,) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, item,)| (i.to_string(), item.clone(),),)
            .collect(),),
        other => Err(IngestorError::Other(format!(
            "cannot store a {:?} value as a document",
            other.element_type()
        ),),),
    }
}

#[async_trait]
impl DocumentStore for MongoCollection {
    async fn insert_many(&self, documents: &[Bson],) -> Result<WriteOutcome,> {
        if documents.is_empty() {
            return Ok(WriteOutcome::acknowledged(),);
        }
        let docs = documents
            .iter()
            .map(to_root_document,)
            .collect::<Result<Vec<_,>,>>()?;
        let options = InsertManyOptions::builder().ordered(true,).build();
        let result = self
            .collection
            .insert_many(docs, options,)
            .await
            .map_err(|e| classify("Failed to insert documents into MongoDB", e,),)?;
        debug!(
            "Inserted {} documents into '{}'",
            result.inserted_ids.len(),
            self.name
        );
        Ok(WriteOutcome::acknowledged(),)
    }

    async fn update(
        &self,
        query: &Document,
        update: &UpdateDocument,
        upsert: bool,
        multi: bool,
    ) -> Result<WriteOutcome,> {
        let result = match update {
            UpdateDocument::Modifiers(modifiers,) => {
                let options = UpdateOptions::builder().upsert(upsert,).build();
                if multi {
                    self.collection
                        .update_many(query.clone(), modifiers.clone(), options,)
                        .await
                } else {
                    self.collection
                        .update_one(query.clone(), modifiers.clone(), options,)
                        .await
                }
            },
            UpdateDocument::Replacement(replacement,) => {
                if multi {
                    return Err(IngestorError::ConfigurationError(
                        "a replacement document cannot be applied to multiple matches"
                            .to_string(),
                    ),);
                }
                let replacement = to_root_document(replacement,)?;
                let options = ReplaceOptions::builder().upsert(upsert,).build();
                self.collection
                    .replace_one(query.clone(), replacement, options,)
                    .await
            },
        }
        .map_err(|e| classify("Failed to upsert into MongoDB", e,),)?;

        debug!(
            "Matched {} and modified {} documents in '{}'{}",
            result.matched_count,
            result.modified_count,
            self.name,
            if result.upserted_id.is_some() { " (inserted)" } else { "" }
        );
        Ok(WriteOutcome::acknowledged(),)
    }

    async fn drop_collection(&self,) -> Result<(),> {
        self.collection
            .drop(None,)
            .await
            .map_err(|e| classify("Failed to drop MongoDB collection", e,),)
    }

    async fn ensure_collection(&self,) -> Result<(),> {
        let existing = self
            .database
            .list_collection_names(None,)
            .await
            .map_err(|e| classify("Failed to list MongoDB collections", e,),)?;
        if existing.iter().any(|n| n == &self.name,) {
            return Ok((),);
        }
        match self.database.create_collection(&self.name, None,).await {
            Ok(_,) => Ok((),),
            Err(e,) if is_namespace_exists(&e,) => {
                debug!("Collection '{}' was created concurrently", self.name);
                Ok((),)
            },
            Err(e,) => Err(classify("Failed to create MongoDB collection", e,),),
        }
    }

    async fn create_index(&self, index: &IndexSpec, background: bool,) -> Result<(),> {
        let options = IndexOptions::builder()
            .unique(index.unique,)
            .sparse(index.sparse,)
            .background(background,)
            .build();
        let model = IndexModel::builder()
            .keys(index.keys(),)
            .options(options,)
            .build();
        self.collection
            .create_index(model, None,)
            .await
            .map(|_| (),)
            .map_err(|e| classify("Failed to create MongoDB index", e,),)
    }

    async fn drop_index(&self, index: &IndexSpec,) -> Result<(),> {
        self.collection
            .drop_index(index.name(), None,)
            .await
            .map_err(|e| classify("Failed to drop MongoDB index", e,),)
    }

    async fn release(&self,) -> Result<(),> {
        self.client.clone().shutdown().await;
        Ok((),)
    }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::{bson, from_document};
    use mongodb::error::CommandError;

    use super::*;

    #[test]
    fn array_roots_are_keyed_by_position() {
        let stored = to_root_document(&bson!(["a", { "b": 1 }]),).unwrap();
        assert_eq!(stored, doc! { "0": "a", "1": { "b": 1 } });
        assert!(to_root_document(&Bson::Int32(1,),).is_err());
    }

    fn command_error(code: i32, name: &str,) -> mongodb::error::Error {
        let command: CommandError = from_document(doc! {
            "code": code,
            "codeName": name,
            "errmsg": "collection already exists",
        },)
        .unwrap();
        ErrorKind::Command(command,).into()
    }

    #[test]
    fn concurrent_collection_creation_is_tolerated() {
        assert!(is_namespace_exists(&command_error(48, "NamespaceExists")));
        assert!(!is_namespace_exists(&command_error(13, "Unauthorized")));

        let err = classify("Failed to create MongoDB collection", command_error(13, "Unauthorized"),);
        assert!(matches!(err, IngestorError::DatabaseError(_)));
    }
}
