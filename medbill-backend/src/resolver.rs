//! Credential resolution
//!
//! [`CredentialResolver`] turns [`RawCredentialInputs`] into a [`Credential`]
//! by walking an ordered list of [`CredentialStrategy`] values:
//!
//! 1. [`CredentialSource::ServiceAccountJson`]: full JSON key document
//! 2. [`CredentialSource::Base64Key`]: base64-encoded PEM (or JSON document)
//! 3. [`CredentialSource::RawKey`]: PEM pasted directly, quoted and/or escaped
//! 4. [`CredentialSource::AmbientDefault`]: platform default credentials
//!
//! A failing source is recorded as a WARN diagnostic and resolution moves on.
//! Only when every source has been tried does resolution fail, with
//! [`Error::NoCredentialAvailable`] naming all of them.

use crate::config::{InputSource, RawCredentialInputs};
use crate::diagnostics::DiagnosticEmitter;
use crate::error::{Error, Result};
use crate::key_format::{decode_base64_text, normalize_key, normalize_raw_key, NormalizedKey};
use crate::service_account::ServiceAccountDocument;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

const DIAGNOSTIC_SOURCE: &str = "credential-resolver";

/// A named credential source, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialSource {
    /// Full JSON service-account document
    ServiceAccountJson,
    /// Base64-encoded PEM key
    Base64Key,
    /// Raw PEM key string
    RawKey,
    /// Platform default credential discovery
    AmbientDefault,
}

impl CredentialSource {
    /// Every source, in the order the default chain tries them
    pub const ALL: [CredentialSource; 4] = [
        CredentialSource::ServiceAccountJson,
        CredentialSource::Base64Key,
        CredentialSource::RawKey,
        CredentialSource::AmbientDefault,
    ];

    /// Stable name used in diagnostics and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::ServiceAccountJson => "service-account-json",
            CredentialSource::Base64Key => "base64-key",
            CredentialSource::RawKey => "raw-key",
            CredentialSource::AmbientDefault => "ambient-default",
        }
    }

    /// The environment variable carrying this source's key material
    pub fn env_var(&self) -> Option<&'static str> {
        match self {
            CredentialSource::ServiceAccountJson => Some(crate::config::ENV_SERVICE_ACCOUNT_JSON),
            CredentialSource::Base64Key => Some(crate::config::ENV_PRIVATE_KEY_BASE64),
            CredentialSource::RawKey => Some(crate::config::ENV_PRIVATE_KEY),
            CredentialSource::AmbientDefault => None,
        }
    }
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated service-account credential
///
/// All four fields are non-empty; [`ResolvedCredential::new`] refuses
/// anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    project_id: String,
    principal_email: String,
    private_key: NormalizedKey,
    storage_target: String,
}

impl ResolvedCredential {
    /// Validate and assemble a credential
    pub fn new(
        project_id: impl Into<String>,
        principal_email: impl Into<String>,
        private_key: NormalizedKey,
        storage_target: impl Into<String>,
    ) -> Result<Self> {
        let project_id = required(project_id.into(), crate::config::ENV_PROJECT_ID)?;
        let principal_email = required(principal_email.into(), crate::config::ENV_CLIENT_EMAIL)?;
        let storage_target = required(storage_target.into(), crate::config::ENV_STORAGE_BUCKET)?;
        Ok(Self {
            project_id,
            principal_email,
            private_key,
            storage_target,
        })
    }

    /// Project identifier
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Service-account email
    pub fn principal_email(&self) -> &str {
        &self.principal_email
    }

    /// Normalized PEM key
    pub fn private_key(&self) -> &NormalizedKey {
        &self.private_key
    }

    /// Object-store bucket name
    pub fn storage_target(&self) -> &str {
        &self.storage_target
    }
}

fn required(value: String, name: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(Error::MissingConfig(format!("{} is not set", name)))
    } else {
        Ok(trimmed.to_string())
    }
}

/// How the platform provides default credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmbientOrigin {
    /// A credentials file named by `GOOGLE_APPLICATION_CREDENTIALS`
    CredentialsFile(PathBuf),
    /// A managed runtime metadata server, identified by its marker variable
    ManagedRuntime(String),
}

/// Credentials the platform supplies without explicit key material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbientCredential {
    /// Project identifier, if configured
    pub project_id: Option<String>,
    /// Object-store bucket name, if configured
    pub storage_target: Option<String>,
    /// Where the platform credentials come from
    pub origin: AmbientOrigin,
}

/// A credential ready to hand to a backend connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Explicit service-account key
    ServiceAccount(ResolvedCredential),
    /// Platform default credentials
    Ambient(AmbientCredential),
}

impl Credential {
    /// Object-store bucket name
    pub fn storage_target(&self) -> Option<&str> {
        match self {
            Credential::ServiceAccount(c) => Some(c.storage_target()),
            Credential::Ambient(a) => a.storage_target.as_deref(),
        }
    }

    /// Project identifier
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Credential::ServiceAccount(c) => Some(c.project_id()),
            Credential::Ambient(a) => a.project_id.as_deref(),
        }
    }

    /// The PEM key, for explicit credentials
    pub fn private_key(&self) -> Option<&NormalizedKey> {
        match self {
            Credential::ServiceAccount(c) => Some(c.private_key()),
            Credential::Ambient(_) => None,
        }
    }

    /// Loggable summary; carries lengths and a fingerprint, never key text
    pub fn summary(&self) -> Value {
        match self {
            Credential::ServiceAccount(c) => json!({
                "projectId": c.project_id(),
                "clientEmail": c.principal_email(),
                "privateKeyLength": c.private_key().len(),
                "keyFingerprint": c.private_key().fingerprint(),
                "storageBucket": c.storage_target(),
            }),
            Credential::Ambient(a) => json!({
                "projectId": a.project_id,
                "storageBucket": a.storage_target,
                "origin": match &a.origin {
                    AmbientOrigin::CredentialsFile(path) => format!("file:{}", path.display()),
                    AmbientOrigin::ManagedRuntime(marker) => format!("runtime:{}", marker),
                },
            }),
        }
    }
}

/// Platform default credential discovery
pub trait AmbientDiscovery: Send + Sync + fmt::Debug {
    /// Discover credentials or explain why none are available
    fn discover(&self, inputs: &RawCredentialInputs) -> Result<AmbientCredential>;
}

/// Application-default discovery from the captured inputs
///
/// Accepts a readable file at `GOOGLE_APPLICATION_CREDENTIALS`, otherwise a
/// detected managed runtime. Fails with [`Error::AmbientUnavailable`] when
/// neither is present.
#[derive(Debug, Default, Clone)]
pub struct EnvironmentAmbientDiscovery;

impl AmbientDiscovery for EnvironmentAmbientDiscovery {
    fn discover(&self, inputs: &RawCredentialInputs) -> Result<AmbientCredential> {
        let ambient = |origin| AmbientCredential {
            project_id: inputs.project_id.clone(),
            storage_target: inputs.storage_bucket.clone(),
            origin,
        };

        let file_problem = match &inputs.application_credentials_path {
            Some(path) => match std::fs::metadata(path) {
                Ok(meta) if meta.is_file() => {
                    return Ok(ambient(AmbientOrigin::CredentialsFile(path.clone())))
                }
                Ok(_) => Some(format!("{} is not a regular file", path.display())),
                Err(e) => Some(format!("cannot read {}: {}", path.display(), e)),
            },
            None => None,
        };

        if let Some(marker) = &inputs.managed_runtime {
            return Ok(ambient(AmbientOrigin::ManagedRuntime(marker.clone())));
        }

        Err(Error::AmbientUnavailable(file_problem.unwrap_or_else(|| {
            format!(
                "{} is not set and no managed runtime was detected",
                crate::config::ENV_APPLICATION_CREDENTIALS
            )
        })))
    }
}

/// One step of the resolution chain
pub trait CredentialStrategy: Send + Sync + fmt::Debug {
    /// The source this strategy reads
    fn source(&self) -> CredentialSource;

    /// Try to build a credential
    ///
    /// Returns `Ok(None)` when the source is not configured at all.
    fn attempt(&self, inputs: &RawCredentialInputs) -> Result<Option<Credential>>;
}

/// Full JSON service-account document
#[derive(Debug, Default, Clone)]
pub struct ServiceAccountJsonStrategy;

impl CredentialStrategy for ServiceAccountJsonStrategy {
    fn source(&self) -> CredentialSource {
        CredentialSource::ServiceAccountJson
    }

    fn attempt(&self, inputs: &RawCredentialInputs) -> Result<Option<Credential>> {
        let Some(text) = &inputs.service_account_json else {
            return Ok(None);
        };
        let document = ServiceAccountDocument::parse(text)?;
        from_document(document, inputs).map(Some)
    }
}

/// Base64-encoded PEM, or a base64-encoded JSON document
#[derive(Debug, Default, Clone)]
pub struct Base64KeyStrategy;

impl CredentialStrategy for Base64KeyStrategy {
    fn source(&self) -> CredentialSource {
        CredentialSource::Base64Key
    }

    fn attempt(&self, inputs: &RawCredentialInputs) -> Result<Option<Credential>> {
        let Some(encoded) = &inputs.private_key_base64 else {
            return Ok(None);
        };
        let text = decode_base64_text(encoded)?;
        if ServiceAccountDocument::looks_like_document(&text) {
            let document = ServiceAccountDocument::parse(&text).map_err(|e| match e {
                Error::DecodeFailure { message, .. } => Error::DecodeFailure {
                    origin: CredentialSource::Base64Key,
                    message: format!("decoded JSON document is invalid: {}", message),
                },
                other => other,
            })?;
            return from_document(document, inputs).map(Some);
        }
        let key = normalize_raw_key(&text)?;
        if !key.body_is_base64() {
            return Err(Error::DecodeFailure {
                origin: CredentialSource::Base64Key,
                message: "decoded text is not a PEM key".to_string(),
            });
        }
        explicit_credential(key, inputs).map(Some)
    }
}

/// PEM key pasted directly
#[derive(Debug, Default, Clone)]
pub struct RawKeyStrategy;

impl CredentialStrategy for RawKeyStrategy {
    fn source(&self) -> CredentialSource {
        CredentialSource::RawKey
    }

    fn attempt(&self, inputs: &RawCredentialInputs) -> Result<Option<Credential>> {
        let Some(raw) = &inputs.private_key else {
            return Ok(None);
        };
        let key = normalize_raw_key(raw)?;
        explicit_credential(key, inputs).map(Some)
    }
}

/// Platform default credentials; always attempted
#[derive(Debug, Clone)]
pub struct AmbientDefaultStrategy {
    discovery: Arc<dyn AmbientDiscovery>,
}

impl AmbientDefaultStrategy {
    /// Wrap a discovery mechanism
    pub fn new(discovery: Arc<dyn AmbientDiscovery>) -> Self {
        Self { discovery }
    }
}

impl Default for AmbientDefaultStrategy {
    fn default() -> Self {
        Self::new(Arc::new(EnvironmentAmbientDiscovery))
    }
}

impl CredentialStrategy for AmbientDefaultStrategy {
    fn source(&self) -> CredentialSource {
        CredentialSource::AmbientDefault
    }

    fn attempt(&self, inputs: &RawCredentialInputs) -> Result<Option<Credential>> {
        self.discovery
            .discover(inputs)
            .map(|ambient| Some(Credential::Ambient(ambient)))
    }
}

fn from_document(document: ServiceAccountDocument, inputs: &RawCredentialInputs) -> Result<Credential> {
    let key_text = document.private_key.as_deref().ok_or_else(|| {
        Error::MalformedKey("service account document has no private_key".to_string())
    })?;
    let key = normalize_key(key_text)?;
    let project_id = document
        .project_id
        .clone()
        .or_else(|| inputs.project_id.clone())
        .unwrap_or_default();
    let email = document
        .client_email
        .clone()
        .or_else(|| inputs.client_email.clone())
        .unwrap_or_default();
    let bucket = inputs.storage_bucket.clone().unwrap_or_default();
    ResolvedCredential::new(project_id, email, key, bucket).map(Credential::ServiceAccount)
}

fn explicit_credential(key: NormalizedKey, inputs: &RawCredentialInputs) -> Result<Credential> {
    ResolvedCredential::new(
        inputs.project_id.clone().unwrap_or_default(),
        inputs.client_email.clone().unwrap_or_default(),
        key,
        inputs.storage_bucket.clone().unwrap_or_default(),
    )
    .map(Credential::ServiceAccount)
}

/// The default four-step chain
pub fn default_strategies(discovery: Arc<dyn AmbientDiscovery>) -> Vec<Arc<dyn CredentialStrategy>> {
    vec![
        Arc::new(ServiceAccountJsonStrategy),
        Arc::new(Base64KeyStrategy),
        Arc::new(RawKeyStrategy),
        Arc::new(AmbientDefaultStrategy::new(discovery)),
    ]
}

/// What happened to one source during resolution
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Not configured
    Skipped,
    /// Configured but unusable
    Failed(Error),
    /// Produced the credential
    Succeeded,
}

/// One entry of the resolution trail
#[derive(Debug, Clone, PartialEq)]
pub struct SourceAttempt {
    /// The source tried
    pub source: CredentialSource,
    /// Its outcome
    pub outcome: AttemptOutcome,
}

/// A successful resolution and the trail that led to it
#[derive(Debug, Clone)]
pub struct Resolution {
    credential: Credential,
    source: CredentialSource,
    attempts: Vec<SourceAttempt>,
}

impl Resolution {
    /// The resolved credential
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// The source that produced it
    pub fn source(&self) -> CredentialSource {
        self.source
    }

    /// Every source consulted, in order, with outcomes
    pub fn attempts(&self) -> &[SourceAttempt] {
        &self.attempts
    }

    /// Sources consulted, in order, ending with the successful one
    pub fn attempted_sources(&self) -> Vec<CredentialSource> {
        self.attempts.iter().map(|a| a.source).collect()
    }

    /// Consume and return the credential
    pub fn into_credential(self) -> Credential {
        self.credential
    }
}

/// Resolves credentials through an ordered strategy chain
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    inputs: InputSource,
    strategies: Vec<Arc<dyn CredentialStrategy>>,
    emitter: DiagnosticEmitter,
}

impl CredentialResolver {
    /// Resolver with the default chain and environment ambient discovery
    pub fn new(inputs: impl Into<InputSource>, emitter: DiagnosticEmitter) -> Self {
        Self::with_strategies(
            inputs,
            default_strategies(Arc::new(EnvironmentAmbientDiscovery)),
            emitter,
        )
    }

    /// Resolver with an explicit chain
    pub fn with_strategies(
        inputs: impl Into<InputSource>,
        strategies: Vec<Arc<dyn CredentialStrategy>>,
        emitter: DiagnosticEmitter,
    ) -> Self {
        Self {
            inputs: inputs.into(),
            strategies,
            emitter,
        }
    }

    /// Replace the chain with the default one using a different discovery
    pub fn with_ambient_discovery(mut self, discovery: Arc<dyn AmbientDiscovery>) -> Self {
        self.strategies = default_strategies(discovery);
        self
    }

    /// The sources this resolver tries, in order
    pub fn sources(&self) -> Vec<CredentialSource> {
        self.strategies.iter().map(|s| s.source()).collect()
    }

    /// The emitter diagnostics are sent to
    pub fn emitter(&self) -> &DiagnosticEmitter {
        &self.emitter
    }

    /// Load the current inputs and resolve them
    pub fn resolve(&self) -> Result<Resolution> {
        let inputs = self.inputs.load();
        self.resolve_inputs(&inputs)
    }

    /// Resolve a specific set of inputs
    pub fn resolve_inputs(&self, inputs: &RawCredentialInputs) -> Result<Resolution> {
        self.emitter.info(
            DIAGNOSTIC_SOURCE,
            "Resolving backend credential",
            Some(json!({
                "sources": self.sources().iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                "projectId": inputs.project_id,
                "clientEmail": inputs.client_email,
                "storageBucket": inputs.storage_bucket,
            })),
        );

        let mut attempts = Vec::with_capacity(self.strategies.len());
        let mut last_error = None;

        for strategy in &self.strategies {
            let source = strategy.source();
            match strategy.attempt(inputs) {
                Ok(None) => {
                    self.emitter.debug(
                        DIAGNOSTIC_SOURCE,
                        format!("{} not configured, skipping", source),
                        None,
                    );
                    attempts.push(SourceAttempt {
                        source,
                        outcome: AttemptOutcome::Skipped,
                    });
                }
                Ok(Some(credential)) => {
                    let mut summary = credential.summary();
                    if let Value::Object(map) = &mut summary {
                        map.insert("source".to_string(), json!(source.as_str()));
                    }
                    self.emitter.info(
                        DIAGNOSTIC_SOURCE,
                        format!("Resolved credential from {}", source),
                        Some(summary),
                    );
                    attempts.push(SourceAttempt {
                        source,
                        outcome: AttemptOutcome::Succeeded,
                    });
                    return Ok(Resolution {
                        credential,
                        source,
                        attempts,
                    });
                }
                Err(err) => {
                    self.emitter.warn(
                        DIAGNOSTIC_SOURCE,
                        format!("{} failed, trying next source", source),
                        Some(json!({
                            "source": source.as_str(),
                            "error": err.to_string(),
                        })),
                    );
                    attempts.push(SourceAttempt {
                        source,
                        outcome: AttemptOutcome::Failed(err.clone()),
                    });
                    last_error = Some(Box::new(err));
                }
            }
        }

        let attempted_sources: Vec<CredentialSource> = attempts.iter().map(|a| a.source).collect();
        self.emitter.error(
            DIAGNOSTIC_SOURCE,
            "All credential sources exhausted",
            Some(json!({
                "attemptedSources": attempted_sources.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                "lastError": last_error.as_ref().map(|e| e.to_string()),
            })),
        );
        Err(Error::NoCredentialAvailable {
            attempted_sources,
            last_error,
        })
    }
}
