//! Configuration for the backend bootstrap
//!
//! Credential inputs arrive through environment variables whose formatting is
//! not under our control. [`RawCredentialInputs`] captures them as an
//! unordered bag of optional strings; [`InputSource`] decides where that bag
//! is read from on every resolution attempt.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Full JSON service-account document
pub const ENV_SERVICE_ACCOUNT_JSON: &str = "FIREBASE_SERVICE_ACCOUNT_JSON";
/// Base64-encoded PEM private key
pub const ENV_PRIVATE_KEY_BASE64: &str = "FIREBASE_PRIVATE_KEY_BASE64";
/// PEM private key, possibly quoted or with literal `\n` escapes
pub const ENV_PRIVATE_KEY: &str = "FIREBASE_PRIVATE_KEY";
/// Project identifier
pub const ENV_PROJECT_ID: &str = "FIREBASE_PROJECT_ID";
/// Service-account email
pub const ENV_CLIENT_EMAIL: &str = "FIREBASE_CLIENT_EMAIL";
/// Object-store bucket name
pub const ENV_STORAGE_BUCKET: &str = "FIREBASE_STORAGE_BUCKET";
/// Path consulted by application-default credential discovery
pub const ENV_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Variables whose presence marks a managed runtime with a metadata server
pub const MANAGED_RUNTIME_MARKERS: &[&str] = &[
    "K_SERVICE",
    "FUNCTION_TARGET",
    "GAE_APPLICATION",
    "GCE_METADATA_HOST",
];

/// Client init timeout override, in seconds
pub const ENV_INIT_TIMEOUT_SECS: &str = "MEDBILL_INIT_TIMEOUT_SECS";
/// Directory for temporary key files
pub const ENV_KEY_FILE_DIR: &str = "MEDBILL_KEY_FILE_DIR";

/// Named credential inputs supplied by the deployment environment
///
/// Empty and whitespace-only values are stored as `None`: orchestrators often
/// define a variable without a value, which must read as "not configured".
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RawCredentialInputs {
    /// Full JSON service-account document
    pub service_account_json: Option<String>,
    /// Base64-encoded PEM blob
    pub private_key_base64: Option<String>,
    /// Raw PEM key string
    pub private_key: Option<String>,
    /// Project identifier
    pub project_id: Option<String>,
    /// Service-account email
    pub client_email: Option<String>,
    /// Object-store bucket name
    pub storage_bucket: Option<String>,
    /// Application-default credentials file path
    pub application_credentials_path: Option<PathBuf>,
    /// Name of the first managed-runtime marker found, if any
    pub managed_runtime: Option<String>,
}

impl RawCredentialInputs {
    /// Create an empty set of inputs
    pub fn new() -> Self {
        Self::default()
    }

    /// Read inputs from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read inputs through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| non_blank(lookup(name));
        Self {
            service_account_json: get(ENV_SERVICE_ACCOUNT_JSON),
            private_key_base64: get(ENV_PRIVATE_KEY_BASE64),
            private_key: get(ENV_PRIVATE_KEY),
            project_id: get(ENV_PROJECT_ID).map(|v| v.trim().to_string()),
            client_email: get(ENV_CLIENT_EMAIL).map(|v| v.trim().to_string()),
            storage_bucket: get(ENV_STORAGE_BUCKET).map(|v| v.trim().to_string()),
            application_credentials_path: get(ENV_APPLICATION_CREDENTIALS)
                .map(|v| PathBuf::from(v.trim())),
            managed_runtime: MANAGED_RUNTIME_MARKERS
                .iter()
                .find(|name| get(name).is_some())
                .map(|name| name.to_string()),
        }
    }

    /// Sets the service-account JSON document
    pub fn with_service_account_json(mut self, value: impl Into<String>) -> Self {
        self.service_account_json = non_blank(Some(value.into()));
        self
    }

    /// Sets the base64-encoded key
    pub fn with_private_key_base64(mut self, value: impl Into<String>) -> Self {
        self.private_key_base64 = non_blank(Some(value.into()));
        self
    }

    /// Sets the raw PEM key
    pub fn with_private_key(mut self, value: impl Into<String>) -> Self {
        self.private_key = non_blank(Some(value.into()));
        self
    }

    /// Sets the project identifier
    pub fn with_project_id(mut self, value: impl Into<String>) -> Self {
        self.project_id = non_blank(Some(value.into()));
        self
    }

    /// Sets the service-account email
    pub fn with_client_email(mut self, value: impl Into<String>) -> Self {
        self.client_email = non_blank(Some(value.into()));
        self
    }

    /// Sets the storage bucket
    pub fn with_storage_bucket(mut self, value: impl Into<String>) -> Self {
        self.storage_bucket = non_blank(Some(value.into()));
        self
    }

    /// Sets the application-default credentials path
    pub fn with_application_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.application_credentials_path = Some(path.into());
        self
    }

    /// Marks the inputs as coming from a managed runtime
    pub fn with_managed_runtime(mut self, marker: impl Into<String>) -> Self {
        self.managed_runtime = Some(marker.into());
        self
    }

    /// True when no private-key-bearing source is configured
    pub fn has_no_key_material(&self) -> bool {
        self.service_account_json.is_none()
            && self.private_key_base64.is_none()
            && self.private_key.is_none()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn describe_secret(value: &Option<String>) -> String {
    match value {
        Some(v) => format!("<{} chars>", v.len()),
        None => "None".to_string(),
    }
}

// Key-bearing fields are reported by length only
impl fmt::Debug for RawCredentialInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCredentialInputs")
            .field(
                "service_account_json",
                &describe_secret(&self.service_account_json),
            )
            .field(
                "private_key_base64",
                &describe_secret(&self.private_key_base64),
            )
            .field("private_key", &describe_secret(&self.private_key))
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("storage_bucket", &self.storage_bucket)
            .field(
                "application_credentials_path",
                &self.application_credentials_path,
            )
            .field("managed_runtime", &self.managed_runtime)
            .finish()
    }
}

/// Where credential inputs are read from
///
/// Inputs are loaded again on every resolution attempt, so a retry after a
/// failure sees variables that were propagated late.
#[derive(Clone)]
pub enum InputSource {
    /// Read the process environment on every attempt
    Environment,
    /// Always use the same inputs
    Fixed(RawCredentialInputs),
    /// Call a closure on every attempt
    Dynamic(Arc<dyn Fn() -> RawCredentialInputs + Send + Sync>),
}

impl InputSource {
    /// Wrap a closure as an input source
    pub fn dynamic<F>(load: F) -> Self
    where
        F: Fn() -> RawCredentialInputs + Send + Sync + 'static,
    {
        InputSource::Dynamic(Arc::new(load))
    }

    /// Take a snapshot of the current inputs
    pub fn load(&self) -> RawCredentialInputs {
        match self {
            InputSource::Environment => RawCredentialInputs::from_env(),
            InputSource::Fixed(inputs) => inputs.clone(),
            InputSource::Dynamic(load) => load(),
        }
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::Environment => write!(f, "InputSource::Environment"),
            InputSource::Fixed(inputs) => f.debug_tuple("InputSource::Fixed").field(inputs).finish(),
            InputSource::Dynamic(_) => write!(f, "InputSource::Dynamic(<function>)"),
        }
    }
}

impl Default for InputSource {
    fn default() -> Self {
        InputSource::Environment
    }
}

impl From<RawCredentialInputs> for InputSource {
    fn from(inputs: RawCredentialInputs) -> Self {
        InputSource::Fixed(inputs)
    }
}

/// Configuration for the client manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    /// Timeout for the backend connection of one initialization attempt, in seconds
    pub init_timeout_secs: u64,

    /// Directory for temporary key files; the OS temp dir when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            init_timeout_secs: 30,
            key_file_dir: None,
        }
    }
}

impl ClientConfig {
    /// Build a config from `MEDBILL_*` variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            init_timeout_secs: std::env::var(ENV_INIT_TIMEOUT_SECS)
                .ok()
                .and_then(|t| t.trim().parse::<u64>().ok())
                .filter(|t| *t > 0)
                .unwrap_or(defaults.init_timeout_secs),
            key_file_dir: std::env::var(ENV_KEY_FILE_DIR)
                .ok()
                .filter(|d| !d.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    /// Sets the initialization timeout
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Sets the key file directory
    pub fn with_key_file_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_file_dir = Some(dir.into());
        self
    }

    /// Returns the initialization timeout as a Duration
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }
}
