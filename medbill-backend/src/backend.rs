//! Backend abstractions
//!
//! The billing services talk to two stores: a document store for structured
//! records and an object store for uploaded files. A [`BackendConnector`]
//! turns a resolved [`Credential`] into a [`ClientHandle`] holding both.

use crate::error::Result;
use crate::resolver::{Credential, CredentialSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A document: a JSON object
pub type Document = Map<String, Value>;

/// Sort direction for [`Query::order_by`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ascending,
    Descending,
}

/// Equality filters, one ordering and a limit over one collection
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    /// Collection name
    pub collection: String,
    /// `field == value` filters, all of which must match
    pub filters: Vec<(String, Value)>,
    /// Optional ordering
    pub order: Option<(String, Direction)>,
    /// Optional result cap
    pub limit: Option<usize>,
}

impl Query {
    /// Query every document of a collection
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            ..Self::default()
        }
    }

    /// Add an equality filter
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    /// Order by a field
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order = Some((field.into(), direction));
        self
    }

    /// Cap the number of results
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Structured record storage
#[async_trait]
pub trait DocumentStore: Send + Sync + fmt::Debug {
    /// Fetch one document
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Create or overwrite a document
    async fn set(&self, collection: &str, id: &str, document: Document) -> Result<()>;

    /// Merge fields into an existing document; `NotFound` if absent
    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<()>;

    /// Run a query, returning `(id, document)` pairs
    async fn query(&self, query: &Query) -> Result<Vec<(String, Document)>>;
}

/// Metadata about a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub bucket: String,
    pub path: String,
    pub size: u64,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

/// Time-limited read link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// File storage within one bucket
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// The bucket this store writes to
    fn bucket(&self) -> &str;

    /// Store bytes at a path, replacing any existing object
    async fn write(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectInfo>;

    /// Produce a read link valid for `ttl`
    async fn signed_read_url(&self, path: &str, ttl: Duration) -> Result<SignedUrl>;

    /// Delete an object; `NotFound` if absent
    async fn delete(&self, path: &str) -> Result<()>;

    /// List objects under a prefix, sorted by path
    async fn list(&self, prefix: &str, max_results: Option<usize>) -> Result<Vec<ObjectInfo>>;
}

/// How a connector wants the private key handed over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyDelivery {
    /// The key travels inside [`ConnectRequest::credential`]
    #[default]
    InMemory,
    /// The key is also written to a temporary file whose path is passed in
    /// [`ConnectRequest::key_file`]
    FilePath,
}

/// Input to [`BackendConnector::connect`]
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// The resolved credential
    pub credential: Credential,
    /// The credential source it came from
    pub source: CredentialSource,
    /// Path of the temporary key file, for [`KeyDelivery::FilePath`]
    pub key_file: Option<PathBuf>,
}

/// Builds backend clients from credentials
#[async_trait]
pub trait BackendConnector: Send + Sync + fmt::Debug {
    /// How this connector wants the key delivered
    fn key_delivery(&self) -> KeyDelivery {
        KeyDelivery::InMemory
    }

    /// Construct a client
    ///
    /// Fails with `BackendRejected` when the credential is refused and
    /// `StorageTargetUnavailable` when the bucket cannot be used.
    async fn connect(&self, request: ConnectRequest) -> Result<ClientHandle>;
}

/// An initialized backend client
#[derive(Clone)]
pub struct ClientHandle {
    documents: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    project_id: Option<String>,
    source: CredentialSource,
    connected_at: DateTime<Utc>,
}

impl ClientHandle {
    /// Assemble a handle from its stores
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        project_id: Option<String>,
        source: CredentialSource,
    ) -> Self {
        Self {
            documents,
            objects,
            project_id,
            source,
            connected_at: Utc::now(),
        }
    }

    /// Document store handle
    pub fn documents(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.documents)
    }

    /// Object store handle
    pub fn objects(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.objects)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// The credential source the client was built from
    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("project_id", &self.project_id)
            .field("bucket", &self.objects.bucket())
            .field("source", &self.source)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}
