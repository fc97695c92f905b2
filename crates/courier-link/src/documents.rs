//! Document-model collaborator seam and an in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::dispatch::HandlerError;

/// Document types the store understands.
pub const DOCUMENT_TYPES: &[&str] = &[
    "Actor",
    "Item",
    "Scene",
    "JournalEntry",
    "Macro",
    "Playlist",
    "RollTable",
    "Cards",
    "ChatMessage",
    "Combat",
    "Folder",
    "User",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// `<Type>.<id>`, e.g. `Actor.0190c3...`.
    pub uuid: String,
    pub document_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Invalid entity type: {0}")]
    UnknownType(String),
    #[error("Entity not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error("document backend failed: {0}")]
    Backend(String),
}

impl From<DocumentError> for HandlerError {
    fn from(err: DocumentError) -> Self {
        match err {
            DocumentError::NotFound(_) => HandlerError::NotFound(err.to_string()),
            DocumentError::UnknownType(_) | DocumentError::Invalid(_) => {
                HandlerError::InvalidRequest(err.to_string())
            }
            DocumentError::Backend(_) => HandlerError::Backend(err.to_string()),
        }
    }
}

/// CRUD access to the host application's documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_by_uuid(&self, uuid: &str) -> Result<Option<Document>, DocumentError>;

    async fn create(
        &self,
        document_type: &str,
        data: Value,
        folder: Option<String>,
    ) -> Result<Document, DocumentError>;

    /// Merge `changes` into the document's data.
    async fn update(&self, uuid: &str, changes: Value) -> Result<Document, DocumentError>;

    async fn delete(&self, uuid: &str) -> Result<(), DocumentError>;

    async fn get(&self, uuid: &str) -> Result<Document, DocumentError> {
        self.find_by_uuid(uuid)
            .await?
            .ok_or_else(|| DocumentError::NotFound(uuid.to_owned()))
    }
}

/// Process-local store; backs tests and the demo endpoint.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_by_uuid(&self, uuid: &str) -> Result<Option<Document>, DocumentError> {
        Ok(self.documents.read().get(uuid).cloned())
    }

    async fn create(
        &self,
        document_type: &str,
        data: Value,
        folder: Option<String>,
    ) -> Result<Document, DocumentError> {
        if !DOCUMENT_TYPES.contains(&document_type) {
            return Err(DocumentError::UnknownType(document_type.to_owned()));
        }
        let data = match data {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            _ => return Err(DocumentError::Invalid("data must be an object".into())),
        };
        let document = Document {
            uuid: format!("{document_type}.{}", Uuid::now_v7().simple()),
            document_type: document_type.to_owned(),
            folder,
            data,
        };
        let _ = self
            .documents
            .write()
            .insert(document.uuid.clone(), document.clone());
        Ok(document)
    }

    async fn update(&self, uuid: &str, changes: Value) -> Result<Document, DocumentError> {
        let Value::Object(changes) = changes else {
            return Err(DocumentError::Invalid("updateData must be an object".into()));
        };
        let mut documents = self.documents.write();
        let document = documents
            .get_mut(uuid)
            .ok_or_else(|| DocumentError::NotFound(uuid.to_owned()))?;
        merge_into(&mut document.data, changes);
        Ok(document.clone())
    }

    async fn delete(&self, uuid: &str) -> Result<(), DocumentError> {
        self.documents
            .write()
            .remove(uuid)
            .map(|_| ())
            .ok_or_else(|| DocumentError::NotFound(uuid.to_owned()))
    }
}

/// Objects merge per key; anything else is replaced.
fn merge_into(target: &mut Value, changes: Map<String, Value>) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };
    for (key, value) in changes {
        match value {
            Value::Object(nested) if map.get(&key).is_some_and(Value::is_object) => {
                if let Some(existing) = map.get_mut(&key) {
                    merge_into(existing, nested);
                }
            }
            value => {
                let _ = map.insert(key, value);
            }
        }
    }
}
