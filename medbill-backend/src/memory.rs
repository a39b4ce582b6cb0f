//! In-memory backend
//!
//! A [`BackendConnector`] with in-process document and object stores. It
//! validates credentials the way the hosted backend does (key body must
//! decode, principal must be authorized, bucket must exist) so the whole
//! bootstrap path can be exercised without network access.

use crate::backend::{
    BackendConnector, ClientHandle, ConnectRequest, Direction, Document, DocumentStore,
    KeyDelivery, ObjectInfo, ObjectStore, Query, SignedUrl,
};
use crate::error::{Error, Result};
use crate::resolver::Credential;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::debug;

/// What the connector saw of a temporary key file during `connect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedKeyFile {
    /// Path passed in the request
    pub path: PathBuf,
    /// Unix permission bits, when available
    pub mode: Option<u32>,
    /// Whether the file contents equal the credential's key
    pub matches_key: bool,
}

/// Builder for [`InMemoryBackend`]
#[derive(Debug, Default)]
pub struct InMemoryBackendBuilder {
    principals: Option<HashSet<String>>,
    buckets: HashSet<String>,
    allow_ambient: bool,
    connect_delay: Option<Duration>,
    key_delivery: KeyDelivery,
}

impl InMemoryBackendBuilder {
    /// Authorize a principal; once any is given, all others are rejected
    pub fn allow_principal(mut self, email: impl Into<String>) -> Self {
        self.principals
            .get_or_insert_with(HashSet::new)
            .insert(email.into());
        self
    }

    /// Declare an existing bucket
    pub fn bucket(mut self, name: impl Into<String>) -> Self {
        self.buckets.insert(name.into());
        self
    }

    /// Accept platform default credentials
    pub fn allow_ambient(mut self, allow: bool) -> Self {
        self.allow_ambient = allow;
        self
    }

    /// Delay every `connect` call
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Request a key delivery mode
    pub fn key_delivery(mut self, delivery: KeyDelivery) -> Self {
        self.key_delivery = delivery;
        self
    }

    pub fn build(self) -> InMemoryBackend {
        InMemoryBackend {
            principals: self.principals,
            buckets: self.buckets,
            allow_ambient: self.allow_ambient,
            connect_delay: self.connect_delay,
            key_delivery: self.key_delivery,
            connects: AtomicUsize::new(0),
            observed_key_files: Mutex::new(Vec::new()),
            documents: Arc::new(MemoryDocumentStore::default()),
            objects: RwLock::new(HashMap::new()),
        }
    }
}

/// In-process backend and connector
#[derive(Debug)]
pub struct InMemoryBackend {
    principals: Option<HashSet<String>>,
    buckets: HashSet<String>,
    allow_ambient: bool,
    connect_delay: Option<Duration>,
    key_delivery: KeyDelivery,
    connects: AtomicUsize,
    observed_key_files: Mutex<Vec<ObservedKeyFile>>,
    documents: Arc<MemoryDocumentStore>,
    objects: RwLock<HashMap<String, Arc<MemoryObjectStore>>>,
}

impl InMemoryBackend {
    pub fn builder() -> InMemoryBackendBuilder {
        InMemoryBackendBuilder::default()
    }

    /// Number of `connect` calls so far, successful or not
    pub fn connect_count(&self) -> usize {
        self.connects.load(AtomicOrdering::SeqCst)
    }

    /// Key files seen by `connect`, oldest first
    pub fn observed_key_files(&self) -> Vec<ObservedKeyFile> {
        self.observed_key_files
            .lock()
            .map(|files| files.clone())
            .unwrap_or_default()
    }

    fn authorize(&self, credential: &Credential) -> Result<()> {
        match credential {
            Credential::ServiceAccount(c) => {
                if !c.private_key().body_is_base64() {
                    return Err(Error::BackendRejected(
                        "private key body is not valid base64".to_string(),
                    ));
                }
                if let Some(principals) = &self.principals {
                    if !principals.contains(c.principal_email()) {
                        return Err(Error::BackendRejected(format!(
                            "principal {} is not authorized for project {}",
                            c.principal_email(),
                            c.project_id()
                        )));
                    }
                }
                Ok(())
            }
            Credential::Ambient(_) if self.allow_ambient => Ok(()),
            Credential::Ambient(_) => Err(Error::BackendRejected(
                "platform default credentials are not accepted".to_string(),
            )),
        }
    }

    fn observe_key_file(&self, request: &ConnectRequest) -> Result<()> {
        if self.key_delivery != KeyDelivery::FilePath {
            return Ok(());
        }
        let Some(key) = request.credential.private_key() else {
            return Ok(());
        };
        let path = request.key_file.clone().ok_or_else(|| {
            Error::BackendRejected("connector requires a key file path".to_string())
        })?;
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| Error::BackendRejected(format!("cannot read key file: {}", e)))?;

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            std::fs::metadata(&path)
                .ok()
                .map(|m| m.permissions().mode() & 0o777)
        };
        #[cfg(not(unix))]
        let mode = None;

        let observed = ObservedKeyFile {
            path,
            mode,
            matches_key: contents == key.as_str(),
        };
        self.observed_key_files
            .lock()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?
            .push(observed);
        Ok(())
    }

    fn object_store(&self, bucket: &str) -> Result<Arc<MemoryObjectStore>> {
        if !self.buckets.contains(bucket) {
            return Err(Error::StorageTargetUnavailable(format!(
                "bucket {} does not exist",
                bucket
            )));
        }
        let mut stores = self
            .objects
            .write()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        let store = stores
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(MemoryObjectStore::new(bucket)));
        Ok(Arc::clone(store))
    }
}

#[async_trait]
impl BackendConnector for InMemoryBackend {
    fn key_delivery(&self) -> KeyDelivery {
        self.key_delivery
    }

    async fn connect(&self, request: ConnectRequest) -> Result<ClientHandle> {
        let attempt = self.connects.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        debug!("In-memory backend connect #{} via {}", attempt, request.source);

        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        self.authorize(&request.credential)?;
        self.observe_key_file(&request)?;

        let bucket = request.credential.storage_target().ok_or_else(|| {
            Error::StorageTargetUnavailable("no storage bucket configured".to_string())
        })?;
        let objects = self.object_store(bucket)?;

        Ok(ClientHandle::new(
            self.documents.clone(),
            objects,
            request.credential.project_id().map(str::to_string),
            request.source,
        ))
    }
}

/// Document store over nested maps
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Document>>>,
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        check_path(collection, id)?;
        let collections = self
            .collections
            .read()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn set(&self, collection: &str, id: &str, document: Document) -> Result<()> {
        check_path(collection, id)?;
        let mut collections = self
            .collections
            .write()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<()> {
        check_path(collection, id)?;
        let mut collections = self
            .collections
            .write()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        let document = collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| Error::NotFound(format!("{}/{}", collection, id)))?;
        document.extend(fields);
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<(String, Document)>> {
        let collections = self
            .collections
            .read()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        let Some(collection) = collections.get(&query.collection) else {
            return Ok(Vec::new());
        };

        let mut results: Vec<(String, Document)> = collection
            .iter()
            .filter(|(_, doc)| {
                query
                    .filters
                    .iter()
                    .all(|(field, value)| doc.get(field) == Some(value))
            })
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect();

        if let Some((field, direction)) = &query.order {
            results.sort_by(|(_, a), (_, b)| {
                let ordering = compare_values(a.get(field), b.get(field));
                match direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }
}

// Collection and document names are single path segments
fn check_path(collection: &str, id: &str) -> Result<()> {
    for (kind, name) in [("collection", collection), ("document id", id)] {
        if name.is_empty() || name.contains('/') {
            return Err(Error::DocumentStore(format!("invalid {} {:?}", kind, name)));
        }
    }
    Ok(())
}

// Missing sorts first, then numbers, then strings; everything else by text
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::Number(_)), Some(_)) => Ordering::Less,
        (Some(_), Some(Value::Number(_))) => Ordering::Greater,
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    info: ObjectInfo,
}

/// Object store for one bucket
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Raw bytes of an object
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let objects = self
            .objects
            .read()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        objects
            .get(path)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| Error::NotFound(format!("gs://{}/{}", self.bucket, path)))
    }

    fn signature(&self, path: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.bucket.as_bytes());
        hasher.update(b"/");
        hasher.update(path.as_bytes());
        hasher.update(expires.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn write(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectInfo> {
        if path.is_empty() {
            return Err(Error::ObjectStore("object path is empty".to_string()));
        }
        let info = ObjectInfo {
            bucket: self.bucket.clone(),
            path: path.to_string(),
            size: bytes.len() as u64,
            content_type: content_type.to_string(),
            metadata,
            updated_at: Utc::now(),
        };
        let mut objects = self
            .objects
            .write()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        objects.insert(
            path.to_string(),
            StoredObject {
                bytes,
                info: info.clone(),
            },
        );
        Ok(info)
    }

    async fn signed_read_url(&self, path: &str, ttl: Duration) -> Result<SignedUrl> {
        {
            let objects = self
                .objects
                .read()
                .map_err(|e| Error::LockPoisoned(e.to_string()))?;
            if !objects.contains_key(path) {
                return Err(Error::NotFound(format!("gs://{}/{}", self.bucket, path)));
            }
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::ObjectStore(format!("invalid link lifetime: {}", e)))?;
        let expires_at = Utc::now() + ttl;
        let expires = expires_at.timestamp();
        Ok(SignedUrl {
            url: format!(
                "memory://{}/{}?expires={}&signature={}",
                self.bucket,
                path,
                expires,
                self.signature(path, expires)
            ),
            expires_at,
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut objects = self
            .objects
            .write()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("gs://{}/{}", self.bucket, path)))
    }

    async fn list(&self, prefix: &str, max_results: Option<usize>) -> Result<Vec<ObjectInfo>> {
        let objects = self
            .objects
            .read()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .take(max_results.unwrap_or(usize::MAX))
            .map(|(_, o)| o.info.clone())
            .collect())
    }
}
