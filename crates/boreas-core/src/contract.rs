//! Versioned parse-output contract.
//!
//! Accepting a parse result implies contract compliance: the router only
//! marks a source `completed` after the raw output passes the JSON Schema for
//! its version and deserializes cleanly. A violation is a parse failure in
//! its own right, never a downstream bug.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::AppError;

pub const PARSE_SCHEMA_VERSION_V1: &str = "v1";

/// Strict v1 parse output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParseContract {
    pub schema_version: String,
    pub source_platform: String,
    pub source_id: String,
    pub title: String,
    pub summary: String,
    pub key_points: Vec<String>,
    pub keywords: Vec<String>,
    pub sentiment: String,
    pub language: String,
    pub confidence_model: f64,
}

/// JSON Schema for the v1 contract.
pub fn contract_schema_v1() -> serde_json::Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "schema_version", "source_platform", "source_id", "title",
            "summary", "key_points", "keywords", "sentiment", "language",
            "confidence_model"
        ],
        "properties": {
            "schema_version": { "const": PARSE_SCHEMA_VERSION_V1 },
            "source_platform": { "type": "string", "minLength": 1, "maxLength": 32 },
            "source_id": { "type": "string", "minLength": 1, "maxLength": 256 },
            "title": { "type": "string", "minLength": 1, "maxLength": 300 },
            "summary": { "type": "string", "minLength": 1, "maxLength": 1200 },
            "key_points": {
                "type": "array",
                "items": { "type": "string" },
                "minItems": 1,
                "maxItems": 12
            },
            "keywords": {
                "type": "array",
                "items": { "type": "string" },
                "minItems": 1,
                "maxItems": 20
            },
            "sentiment": { "enum": ["positive", "neutral", "negative"] },
            "language": { "type": "string", "minLength": 2, "maxLength": 8 },
            "confidence_model": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
        }
    })
}

static VALIDATOR: OnceLock<jsonschema::Validator> = OnceLock::new();

fn validator() -> Result<&'static jsonschema::Validator, AppError> {
    if let Some(validator) = VALIDATOR.get() {
        return Ok(validator);
    }
    let compiled = jsonschema::validator_for(&contract_schema_v1())
        .map_err(|e| AppError::ConfigError(format!("parse contract schema invalid: {e}")))?;
    Ok(VALIDATOR.get_or_init(|| compiled))
}

/// Validate raw parser output against the versioned contract.
pub fn validate_contract(
    raw: &serde_json::Value,
    schema_version: &str,
) -> Result<ParseContract, AppError> {
    if schema_version != PARSE_SCHEMA_VERSION_V1 {
        return Err(AppError::UnrecoverableParse {
            code: "schema_unsupported".to_string(),
            message: format!("unsupported schema_version={schema_version}"),
        });
    }

    if let Err(error) = validator()?.validate(raw) {
        return Err(AppError::ContractViolation(error.to_string()));
    }

    let mut contract: ParseContract = serde_json::from_value(raw.clone())
        .map_err(|e| AppError::ContractViolation(e.to_string()))?;

    clean_list(&mut contract.key_points);
    clean_list(&mut contract.keywords);
    if contract.key_points.is_empty() {
        return Err(AppError::ContractViolation(
            "key_points must include at least one non-empty value".to_string(),
        ));
    }
    if contract.keywords.is_empty() {
        return Err(AppError::ContractViolation(
            "keywords must include at least one non-empty value".to_string(),
        ));
    }

    Ok(contract)
}

fn clean_list(values: &mut Vec<String>) {
    *values = values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
}

/// Composite confidence: 70% model self-assessment, 30% output richness.
pub fn composite_confidence(contract: &ParseContract) -> f64 {
    let summary_score = (contract.summary.chars().count() as f64 / 400.0).min(1.0);
    let point_score = (contract.key_points.len() as f64 / 4.0).min(1.0);
    let keyword_score = (contract.keywords.len() as f64 / 6.0).min(1.0);
    let richness = 0.4 * summary_score + 0.3 * point_score + 0.3 * keyword_score;
    (0.7 * contract.confidence_model + 0.3 * richness).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_payload() -> serde_json::Value {
        json!({
            "schema_version": "v1",
            "source_platform": "github",
            "source_id": "rust-lang/rust",
            "title": "Rust 1.90 released",
            "summary": "The release brings faster builds and better diagnostics.",
            "key_points": ["faster builds", "better diagnostics"],
            "keywords": ["rust", "release", "compiler"],
            "sentiment": "positive",
            "language": "en",
            "confidence_model": 0.9
        })
    }

    #[test]
    fn test_valid_payload_passes() {
        let contract = validate_contract(&valid_payload(), "v1").unwrap();
        assert_eq!(contract.source_platform, "github");
        assert_eq!(contract.key_points.len(), 2);
    }

    #[test]
    fn test_missing_field_is_violation() {
        let mut payload = valid_payload();
        payload.as_object_mut().unwrap().remove("summary");
        let err = validate_contract(&payload, "v1").unwrap_err();
        assert!(matches!(err, AppError::ContractViolation(_)));
    }

    #[test]
    fn test_wrong_type_is_violation() {
        let mut payload = valid_payload();
        payload["confidence_model"] = json!("very confident");
        let err = validate_contract(&payload, "v1").unwrap_err();
        assert!(matches!(err, AppError::ContractViolation(_)));
    }

    #[test]
    fn test_unknown_field_is_violation() {
        let mut payload = valid_payload();
        payload["extra"] = json!(true);
        let err = validate_contract(&payload, "v1").unwrap_err();
        assert!(matches!(err, AppError::ContractViolation(_)));
    }

    #[test]
    fn test_bad_sentiment_is_violation() {
        let mut payload = valid_payload();
        payload["sentiment"] = json!("ecstatic");
        let err = validate_contract(&payload, "v1").unwrap_err();
        assert!(matches!(err, AppError::ContractViolation(_)));
    }

    #[test]
    fn test_whitespace_only_keywords_rejected() {
        let mut payload = valid_payload();
        payload["keywords"] = json!(["  ", "\t"]);
        let err = validate_contract(&payload, "v1").unwrap_err();
        assert!(matches!(err, AppError::ContractViolation(_)));
    }

    #[test]
    fn test_unsupported_version_is_unrecoverable() {
        let err = validate_contract(&valid_payload(), "v2").unwrap_err();
        assert!(matches!(err, AppError::UnrecoverableParse { .. }));
    }

    #[test]
    fn test_composite_confidence_blends_model_and_richness() {
        let rich = validate_contract(&valid_payload(), "v1").unwrap();
        let confidence = composite_confidence(&rich);
        assert!(confidence > 0.6 && confidence <= 1.0);

        let mut sparse = rich.clone();
        sparse.confidence_model = 0.1;
        sparse.summary = "short".to_string();
        sparse.key_points = vec!["one".to_string()];
        sparse.keywords = vec!["kw".to_string()];
        assert!(composite_confidence(&sparse) < confidence);
    }
}
