use assert_matches::assert_matches;
use base64::Engine;
use medbill_backend::key_format::{
    decode_base64_text, encode_base64, inspect, inspect_base64, normalize_key, normalize_raw_key,
    PEM_FOOTER, PEM_HEADER, PEM_LINE_WIDTH,
};
use medbill_backend::Error;

fn key_body() -> String {
    let bytes: Vec<u8> = (0..=255u8).cycle().take(1216).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn canonical_pem() -> String {
    let body = key_body();
    let mut pem = format!("{}\n", PEM_HEADER);
    for chunk in body.as_bytes().chunks(PEM_LINE_WIDTH) {
        pem.push_str(std::str::from_utf8(chunk).unwrap());
        pem.push('\n');
    }
    pem.push_str(PEM_FOOTER);
    pem.push('\n');
    pem
}

#[test]
fn test_canonical_key_is_unchanged() {
    let pem = canonical_pem();
    let key = normalize_key(&pem).unwrap();
    assert_eq!(key.as_str(), pem);
}

#[test]
fn test_normalization_is_idempotent() {
    let body = key_body();
    let variants = vec![
        canonical_pem(),
        canonical_pem().replace('\n', "\\n"),
        body.clone(),
        format!("{}{}{}", PEM_HEADER, body, PEM_FOOTER),
        format!("  {}\r\n{}\r\n{}  ", PEM_HEADER, body, PEM_FOOTER),
    ];

    for variant in variants {
        let once = normalize_key(&variant).unwrap();
        let twice = normalize_key(once.as_str()).unwrap();
        assert_eq!(once, twice);
    }
}

#[test]
fn test_header_presence_does_not_matter() {
    let body = key_body();
    let with_armor = normalize_key(&format!("{}\n{}\n{}", PEM_HEADER, body, PEM_FOOTER)).unwrap();
    let bare = normalize_key(&body).unwrap();
    assert_eq!(with_armor, bare);
}

#[test]
fn test_literal_newlines_become_real() {
    let escaped = canonical_pem().replace('\n', "\\n");
    assert!(!escaped.contains('\n'));

    let key = normalize_key(&escaped).unwrap();
    assert!(!key.as_str().contains("\\n"));
    assert!(key.as_str().starts_with(&format!("{}\n", PEM_HEADER)));
    assert!(key.as_str().ends_with(&format!("{}\n", PEM_FOOTER)));
    assert_eq!(key.as_str(), canonical_pem());
}

#[test]
fn test_body_wrapped_at_64_columns() {
    let key = normalize_key(&key_body()).unwrap();
    let lines: Vec<&str> = key.as_str().lines().collect();
    let body_lines = &lines[1..lines.len() - 1];

    assert_eq!(lines[0], PEM_HEADER);
    assert_eq!(lines[lines.len() - 1], PEM_FOOTER);
    for line in &body_lines[..body_lines.len() - 1] {
        assert_eq!(line.len(), PEM_LINE_WIDTH);
    }
    assert!(body_lines[body_lines.len() - 1].len() <= PEM_LINE_WIDTH);
    assert_eq!(key.body_line_count(), body_lines.len());
    assert_eq!(key.body(), key_body());
}

#[test]
fn test_empty_body_is_malformed() {
    let err = normalize_key(&format!("{}\n\n{}\n", PEM_HEADER, PEM_FOOTER)).unwrap_err();
    assert_matches!(err, Error::MalformedKey(_));

    assert_matches!(normalize_key("   \\n  "), Err(Error::MalformedKey(_)));
}

#[test]
fn test_quoted_escaped_raw_key() {
    let raw = format!("\"{}\"", canonical_pem().replace('\n', "\\n"));
    let key = normalize_raw_key(&raw).unwrap();
    assert_eq!(key.as_str(), canonical_pem());
}

#[test]
fn test_only_one_layer_of_quotes_removed() {
    let raw = format!("\"{}\"", key_body());
    assert_eq!(normalize_raw_key(&raw).unwrap().body(), key_body());

    // A lone leading quote is kept and ends up in the body
    let lopsided = format!("\"{}", key_body());
    let key = normalize_raw_key(&lopsided).unwrap();
    assert!(key.body().starts_with('"'));
    assert!(!key.body_is_base64());
}

#[test]
fn test_base64_transport() {
    let key = normalize_key(&canonical_pem()).unwrap();
    let encoded = encode_base64(&key);
    assert_eq!(decode_base64_text(&encoded).unwrap(), key.as_str());

    // Wrapped and unpadded values still decode
    let wrapped: String = encoded
        .trim_end_matches('=')
        .as_bytes()
        .chunks(76)
        .map(|c| std::str::from_utf8(c).unwrap())
        .collect::<Vec<_>>()
        .join("\n");
    assert_eq!(decode_base64_text(&wrapped).unwrap(), key.as_str());
}

#[test]
fn test_invalid_base64_is_decode_failure() {
    assert_matches!(
        decode_base64_text("!!!! not base64 !!!!"),
        Err(Error::DecodeFailure { .. })
    );
    assert_matches!(decode_base64_text(""), Err(Error::DecodeFailure { .. }));
}

#[test]
fn test_debug_and_display_hide_key() {
    let key = normalize_key(&canonical_pem()).unwrap();
    let prefix = &key_body()[..24];
    assert!(!format!("{:?}", key).contains(prefix));
    assert!(!format!("{}", key).contains(prefix));
    assert_eq!(key.fingerprint().len(), 16);
}

#[test]
fn test_inspection_reports_shape_only() {
    let raw = format!("\"{}\"", canonical_pem().replace('\n', "\\n"));
    let report = inspect(&raw);

    assert!(report.quoted);
    assert!(report.contains_literal_newlines);
    assert!(!report.contains_actual_newlines);
    assert!(report.contains_begin_marker);
    let shape = report.normalized.clone().unwrap();
    assert!(shape.body_is_base64);
    assert_eq!(shape.length, canonical_pem().len());

    let json = serde_json::to_string(&report).unwrap();
    assert!(!json.contains(&key_body()[..24]));
    assert!(json.contains("containsLiteralNewlines"));
}

#[test]
fn test_base64_inspection() {
    let encoded = base64::engine::general_purpose::STANDARD.encode(canonical_pem());
    let report = inspect_base64(&encoded);
    assert!(report.decoded);
    assert!(report.key.unwrap().contains_actual_newlines);

    let report = inspect_base64("%%%");
    assert!(!report.decoded);
    assert!(report.decode_error.is_some());
}

#[test]
fn test_base64_inspection_of_service_account_document() {
    let document = serde_json::json!({
        "type": "service_account",
        "project_id": "claims-prod",
        "client_email": "uploader@claims-prod.iam.gserviceaccount.com",
        "private_key": canonical_pem().replace('\n', "\\n"),
    })
    .to_string();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&document);
    let report = inspect_base64(&encoded);

    assert!(report.decoded);
    assert!(report.service_account_document);
    assert_eq!(report.document_error, None);
    let key = report.key.unwrap();
    assert!(key.contains_begin_marker);
    assert_eq!(key.normalized.unwrap().length, canonical_pem().len());

    let truncated = base64::engine::general_purpose::STANDARD.encode("{\"type\": ");
    let report = inspect_base64(&truncated);
    assert!(report.service_account_document);
    assert!(report.document_error.is_some());
    assert!(report.key.is_none());
}
