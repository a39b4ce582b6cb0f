use assert_matches::assert_matches;
use base64::Engine;
use medbill_backend::config::RawCredentialInputs;
use medbill_backend::diagnostics::{DiagnosticEmitter, EventFilter, RecentEvents, Severity};
use medbill_backend::key_format::{normalize_key, PEM_FOOTER, PEM_HEADER};
use medbill_backend::resolver::{
    AmbientCredential, AmbientDiscovery, AmbientOrigin, AttemptOutcome, Credential,
    CredentialResolver, CredentialSource,
};
use medbill_backend::{Error, Result};
use std::sync::Arc;

const PROJECT: &str = "claims-prod";
const EMAIL: &str = "uploader@claims-prod.iam.gserviceaccount.com";
const BUCKET: &str = "claims-prod-documents";

fn key_body() -> String {
    let bytes: Vec<u8> = (0..=255u8).cycle().take(1216).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn pem() -> String {
    format!("{}\n{}\n{}\n", PEM_HEADER, key_body(), PEM_FOOTER)
}

fn base_inputs() -> RawCredentialInputs {
    RawCredentialInputs::new()
        .with_project_id(PROJECT)
        .with_client_email(EMAIL)
        .with_storage_bucket(BUCKET)
}

fn recorder() -> (DiagnosticEmitter, Arc<RecentEvents>) {
    let recent = Arc::new(RecentEvents::new());
    let emitter = DiagnosticEmitter::builder()
        .with_listener(recent.clone())
        .build();
    (emitter, recent)
}

fn warnings(recent: &RecentEvents) -> Vec<medbill_backend::DiagnosticEvent> {
    recent.query(
        &EventFilter::default()
            .source("credential-resolver")
            .severity(Severity::Warn),
    )
}

#[test]
fn test_base64_key_without_raw_key() {
    let encoded = base64::engine::general_purpose::STANDARD.encode(pem());
    let inputs = base_inputs().with_private_key_base64(encoded);
    let (emitter, recent) = recorder();

    let resolution = CredentialResolver::new(inputs, emitter).resolve().unwrap();

    assert_eq!(resolution.source(), CredentialSource::Base64Key);
    assert_eq!(
        resolution.attempted_sources(),
        vec![CredentialSource::ServiceAccountJson, CredentialSource::Base64Key]
    );
    assert_eq!(
        resolution.credential().private_key(),
        Some(&normalize_key(&pem()).unwrap())
    );
    assert_matches!(resolution.attempts()[0].outcome, AttemptOutcome::Skipped);
    assert!(warnings(&recent).is_empty());
}

#[test]
fn test_malformed_json_falls_back_to_base64() {
    let encoded = base64::engine::general_purpose::STANDARD.encode(pem());
    let inputs = base_inputs()
        .with_service_account_json("{\"type\": \"service_account\", \"project_id\": ")
        .with_private_key_base64(encoded);
    let (emitter, recent) = recorder();

    let resolution = CredentialResolver::new(inputs, emitter).resolve().unwrap();

    assert_eq!(resolution.source(), CredentialSource::Base64Key);
    assert_matches!(
        &resolution.attempts()[0].outcome,
        AttemptOutcome::Failed(Error::DecodeFailure {
            origin: CredentialSource::ServiceAccountJson,
            ..
        })
    );

    let warnings = warnings(&recent);
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        warnings[0].payload().unwrap()["source"],
        serde_json::json!("service-account-json")
    );
}

#[test]
fn test_no_sources_lists_every_source() {
    let (emitter, recent) = recorder();

    let err = CredentialResolver::new(base_inputs(), emitter)
        .resolve()
        .unwrap_err();

    assert_matches!(
        &err,
        Error::NoCredentialAvailable { attempted_sources, last_error: Some(last) } => {
            assert_eq!(attempted_sources, &CredentialSource::ALL.to_vec());
            assert_matches!(**last, Error::AmbientUnavailable(_));
        }
    );
    assert!(!err.is_fatal());
    assert_eq!(
        err.to_string().split("(attempted: ").nth(1).unwrap().split(')').next().unwrap(),
        "service-account-json, base64-key, raw-key, ambient-default"
    );

    let errors = recent.query(&EventFilter::default().severity(Severity::Error));
    assert_eq!(errors.len(), 1);
    // Three skipped sources, one ambient failure
    assert_eq!(
        recent
            .query(&EventFilter::default().severity(Severity::Debug))
            .len(),
        3
    );
    assert_eq!(warnings(&recent).len(), 1);
}

#[test]
fn test_quoted_escaped_raw_key() {
    let raw = format!("\"{}\"", pem().replace('\n', "\\n"));
    let inputs = base_inputs().with_private_key(raw);
    let (emitter, _recent) = recorder();

    let resolution = CredentialResolver::new(inputs, emitter).resolve().unwrap();

    assert_eq!(resolution.source(), CredentialSource::RawKey);
    let key = resolution.credential().private_key().unwrap();
    assert!(key.as_str().starts_with(&format!("{}\n", PEM_HEADER)));
    assert!(!key.as_str().contains("\\n"));
    assert!(!key.as_str().contains('"'));
    assert_eq!(key.body(), key_body());
}

#[test]
fn test_garbage_base64_falls_back_to_raw_key() {
    let garbage = "!@#$%^&*()".repeat(4);
    assert_eq!(garbage.len(), 40);
    let inputs = base_inputs()
        .with_private_key_base64(garbage)
        .with_private_key(pem());
    let (emitter, recent) = recorder();

    let resolution = CredentialResolver::new(inputs, emitter).resolve().unwrap();

    assert_eq!(resolution.source(), CredentialSource::RawKey);
    assert_matches!(
        &resolution.attempts()[1].outcome,
        AttemptOutcome::Failed(Error::DecodeFailure {
            origin: CredentialSource::Base64Key,
            ..
        })
    );

    let warnings = warnings(&recent);
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        warnings[0].payload().unwrap()["source"],
        serde_json::json!("base64-key")
    );
    assert!(warnings[0].payload().unwrap()["error"]
        .as_str()
        .unwrap()
        .starts_with("Decode failure for base64-key"));
}

#[test]
fn test_base64_of_non_key_text_is_decode_failure() {
    let encoded = base64::engine::general_purpose::STANDARD.encode("hello, this is not a key!");
    let inputs = base_inputs().with_private_key_base64(encoded);
    let (emitter, _recent) = recorder();

    let err = CredentialResolver::new(inputs, emitter).resolve().unwrap_err();
    assert_eq!(err.attempted_sources(), &CredentialSource::ALL[..]);
}

#[test]
fn test_service_account_document() {
    let document = serde_json::json!({
        "type": "service_account",
        "project_id": "from-document",
        "private_key_id": "k1",
        "private_key": pem(),
        "client_email": "doc@from-document.iam.gserviceaccount.com",
    })
    .to_string();
    let inputs = base_inputs().with_service_account_json(document);
    let (emitter, _recent) = recorder();

    let resolution = CredentialResolver::new(inputs, emitter).resolve().unwrap();

    assert_eq!(resolution.source(), CredentialSource::ServiceAccountJson);
    assert_matches!(resolution.credential(), Credential::ServiceAccount(c) => {
        assert_eq!(c.project_id(), "from-document");
        assert_eq!(c.principal_email(), "doc@from-document.iam.gserviceaccount.com");
        assert_eq!(c.storage_target(), BUCKET);
    });
}

#[test]
fn test_base64_encoded_service_account_document() {
    let document = serde_json::json!({
        "type": "service_account",
        "private_key": pem(),
    })
    .to_string();
    let encoded = base64::engine::general_purpose::STANDARD.encode(document);
    let inputs = base_inputs().with_private_key_base64(encoded);
    let (emitter, _recent) = recorder();

    let resolution = CredentialResolver::new(inputs, emitter).resolve().unwrap();

    assert_eq!(resolution.source(), CredentialSource::Base64Key);
    assert_eq!(resolution.credential().project_id(), Some(PROJECT));
}

#[test]
fn test_missing_project_advances_chain() {
    let inputs = RawCredentialInputs::new()
        .with_client_email(EMAIL)
        .with_storage_bucket(BUCKET)
        .with_private_key(pem())
        .with_managed_runtime("K_SERVICE");
    let (emitter, recent) = recorder();

    let resolution = CredentialResolver::new(inputs, emitter).resolve().unwrap();

    assert_eq!(resolution.source(), CredentialSource::AmbientDefault);
    assert_matches!(
        &resolution.attempts()[2].outcome,
        AttemptOutcome::Failed(Error::MissingConfig(message)) if message.contains("FIREBASE_PROJECT_ID")
    );
    assert_matches!(resolution.credential(), Credential::Ambient(a) => {
        assert_eq!(a.origin, AmbientOrigin::ManagedRuntime("K_SERVICE".to_string()));
        assert_eq!(a.storage_target.as_deref(), Some(BUCKET));
    });
    assert_eq!(warnings(&recent).len(), 1);
}

#[test]
fn test_ambient_credentials_file() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let inputs = base_inputs().with_application_credentials_path(file.path());
    let (emitter, _recent) = recorder();

    let resolution = CredentialResolver::new(inputs, emitter).resolve().unwrap();

    assert_matches!(resolution.credential(), Credential::Ambient(a) => {
        assert_eq!(a.origin, AmbientOrigin::CredentialsFile(file.path().to_path_buf()));
    });
}

#[test]
fn test_missing_credentials_file_is_ambient_failure() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = base_inputs().with_application_credentials_path(dir.path().join("absent.json"));
    let (emitter, _recent) = recorder();

    let err = CredentialResolver::new(inputs, emitter).resolve().unwrap_err();
    assert_matches!(err.root_cause(), Error::AmbientUnavailable(message) if message.contains("absent.json"));
}

#[derive(Debug)]
struct FixedDiscovery;

impl AmbientDiscovery for FixedDiscovery {
    fn discover(&self, inputs: &RawCredentialInputs) -> Result<AmbientCredential> {
        Ok(AmbientCredential {
            project_id: inputs.project_id.clone(),
            storage_target: inputs.storage_bucket.clone(),
            origin: AmbientOrigin::ManagedRuntime("test-metadata".to_string()),
        })
    }
}

#[test]
fn test_custom_ambient_discovery() {
    let (emitter, _recent) = recorder();
    let resolver = CredentialResolver::new(base_inputs(), emitter)
        .with_ambient_discovery(Arc::new(FixedDiscovery));

    let resolution = resolver.resolve().unwrap();
    assert_eq!(resolution.source(), CredentialSource::AmbientDefault);
    assert_eq!(resolution.credential().storage_target(), Some(BUCKET));
}

#[test]
fn test_events_never_contain_key_material() {
    let secret_prefix = key_body()[..32].to_string();
    let inputs = base_inputs()
        .with_service_account_json("not json")
        .with_private_key_base64("%%%")
        .with_private_key(pem().replace('\n', "\\n"));
    let (emitter, recent) = recorder();

    CredentialResolver::new(inputs, emitter).resolve().unwrap();

    let success = recent.query(&EventFilter::default().severity(Severity::Info).limit(1));
    assert_eq!(success[0].message(), "Resolved credential from raw-key");
    let payload = success[0].payload().unwrap();
    assert_eq!(payload["projectId"], serde_json::json!(PROJECT));
    assert_eq!(payload["source"], serde_json::json!("raw-key"));
    assert!(payload["privateKeyLength"].as_u64().unwrap() > 0);

    for event in recent.all() {
        assert!(!event.to_json_line().contains(&secret_prefix));
    }
}
