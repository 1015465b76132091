//! # Payload codec
//!
//! Wire formats used over NOTIFY and in the outbox table:
//!
//! - plain channels carry `{"kwargs": {...}}` where the kwargs object is the
//!   serde rendition of the channel's declared fields (dates as RFC 3339
//!   text, containers element-wise, numeric text preserved exactly via
//!   serde_json's arbitrary-precision numbers);
//! - row-change channels carry `{"app", "model", "old", "new"}` plus optional
//!   `context`, `extras` and `db_version` members, with `null` (never `{}`)
//!   standing for an absent row so "row was absent" stays distinguishable
//!   from "row has no fields".
//!
//! Decoding is schema-driven: the declared field types of the target channel
//! decide how each JSON value is reconstructed, and a required field that is
//! absent without a default fails with [`PgBusError::PayloadDecode`]. For
//! row-change payloads the codec additionally normalizes trigger-emitted
//! column names back to the logical field names the entity type expects,
//! silently dropping columns that no longer exist on the type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PgBusError, Result};

/// Sentinel payload used to kick a bulk recovery sweep on a durable channel.
///
/// The legacy implementation sent the literal text `null`; both forms are
/// recognized on the receiving side.
pub const SENTINEL_PAYLOAD: &str = "";

/// Check whether a raw NOTIFY payload is the recovery sentinel
pub fn is_sentinel(payload: &str) -> bool {
    let trimmed = payload.trim();
    trimmed.is_empty() || trimmed == "null"
}

/// Row-change payload as assembled by the database trigger function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChangePayload {
    /// Application tag identifying the schema the row belongs to
    pub app: String,
    /// Entity type tag
    pub model: String,
    /// Row snapshot before the change; `None` for inserts
    pub old: Option<Map<String, Value>>,
    /// Row snapshot after the change; `None` for deletes
    pub new: Option<Map<String, Value>>,
    /// Request-level metadata injected from the session/transaction setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    /// Server-computed extras from the configured builder function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Map<String, Value>>,
    /// Schema version the trigger was installed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_version: Option<i64>,
}

/// Encode a plain channel's fields into the `{"kwargs": {...}}` envelope
pub fn encode_kwargs<C: Serialize>(channel: &C) -> Result<String> {
    let value = serde_json::to_value(channel)?;
    let Value::Object(kwargs) = value else {
        return Err(PgBusError::decode(
            "channel fields must serialize to a JSON object",
        ));
    };
    let mut envelope = Map::new();
    envelope.insert("kwargs".to_string(), Value::Object(kwargs));
    Ok(Value::Object(envelope).to_string())
}

/// Decode a `{"kwargs": {...}}` envelope into typed channel fields
pub fn decode_kwargs<C: DeserializeOwned>(payload: &str) -> Result<C> {
    let value: Value = serde_json::from_str(payload)?;
    let kwargs = value
        .get("kwargs")
        .cloned()
        .ok_or_else(|| PgBusError::decode("payload is missing the kwargs object"))?;
    Ok(serde_json::from_value(kwargs)?)
}

/// Map trigger-emitted column names onto the logical field names of the
/// target entity type.
///
/// Applied rules, in order, per column:
/// 1. explicit physical-column renames win,
/// 2. a column matching a declared field passes through,
/// 3. a foreign-key `_id` suffix is added or stripped when the adjusted name
///    matches a declared field,
/// 4. anything else is dropped (tolerates schema drift between trigger
///    capture time and decode time).
pub fn normalize_fields(
    raw: Map<String, Value>,
    field_names: &[&str],
    renames: &[(&str, &str)],
) -> Map<String, Value> {
    let mut normalized = Map::new();
    for (column, value) in raw {
        if let Some((_, logical)) = renames.iter().find(|(physical, _)| *physical == column) {
            normalized.insert((*logical).to_string(), value);
            continue;
        }
        if field_names.contains(&column.as_str()) {
            normalized.insert(column, value);
            continue;
        }
        if let Some(stripped) = column.strip_suffix("_id") {
            if field_names.contains(&stripped) {
                normalized.insert(stripped.to_string(), value);
                continue;
            }
        }
        let suffixed = format!("{column}_id");
        if field_names.contains(&suffixed.as_str()) {
            normalized.insert(suffixed, value);
        }
        // Unknown column: dropped.
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ReadsChannel {
        model_id: i64,
        model_type: String,
        date: NaiveDate,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct NestedChannel {
        by_name: BTreeMap<String, bool>,
        dates: Vec<NaiveDate>,
        tags: BTreeSet<String>,
        #[serde(default)]
        weight: f64,
    }

    #[test]
    fn test_kwargs_round_trip_scalars_and_dates() {
        let channel = ReadsChannel {
            model_id: 7,
            model_type: "Post".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        };
        let encoded = encode_kwargs(&channel).unwrap();
        assert!(encoded.contains("\"kwargs\""));
        assert!(encoded.contains("2024-01-01"));

        let decoded: ReadsChannel = decode_kwargs(&encoded).unwrap();
        assert_eq!(channel, decoded);
    }

    #[test]
    fn test_kwargs_round_trip_containers() {
        let channel = NestedChannel {
            by_name: BTreeMap::from([("Paul".to_string(), false)]),
            dates: vec![
                NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2021, 1, 2).unwrap(),
            ],
            tags: BTreeSet::from(["hello".to_string(), "world".to_string()]),
            weight: 0.0,
        };
        let decoded: NestedChannel = decode_kwargs(&encode_kwargs(&channel).unwrap()).unwrap();
        assert_eq!(channel, decoded);
    }

    #[test]
    fn test_datetime_text_round_trips() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct TimedChannel {
            at: NaiveDateTime,
        }
        let channel = TimedChannel {
            at: NaiveDate::from_ymd_opt(2021, 1, 1)
                .unwrap()
                .and_hms_opt(9, 30, 0)
                .unwrap(),
        };
        let decoded: TimedChannel = decode_kwargs(&encode_kwargs(&channel).unwrap()).unwrap();
        assert_eq!(channel, decoded);
    }

    #[test]
    fn test_missing_required_field_fails() {
        let payload = r#"{"kwargs": {"model_id": 7, "model_type": "Post"}}"#;
        let err = decode_kwargs::<ReadsChannel>(payload).unwrap_err();
        assert!(matches!(err, PgBusError::PayloadDecode { .. }));
    }

    #[test]
    fn test_missing_field_with_default_is_tolerated() {
        let payload = r#"{"kwargs": {"by_name": {}, "dates": [], "tags": []}}"#;
        let decoded: NestedChannel = decode_kwargs(payload).unwrap();
        assert_eq!(decoded.weight, 0.0);
    }

    #[test]
    fn test_extra_fields_are_tolerated() {
        let payload =
            r#"{"kwargs": {"model_id": 7, "model_type": "Post", "date": "2024-01-01", "gone": 1}}"#;
        let decoded: ReadsChannel = decode_kwargs(payload).unwrap();
        assert_eq!(decoded.model_id, 7);
    }

    #[test]
    fn test_missing_kwargs_envelope_fails() {
        let err = decode_kwargs::<ReadsChannel>(r#"{"model_id": 7}"#).unwrap_err();
        assert!(matches!(err, PgBusError::PayloadDecode { .. }));
    }

    #[test]
    fn test_exact_numeric_text_is_preserved() {
        // Monetary-grade numerics survive as literal text rather than being
        // coerced through f64.
        let value: Value =
            serde_json::from_str(r#"{"rating": 1.100000000000000000001}"#).unwrap();
        let round_tripped = value.to_string();
        assert!(round_tripped.contains("1.100000000000000000001"));
    }

    #[test]
    fn test_row_change_payload_null_vs_empty_object() {
        let payload: RowChangePayload = serde_json::from_str(
            r#"{"app": "tests", "model": "Post", "old": null, "new": {}}"#,
        )
        .unwrap();
        assert!(payload.old.is_none());
        assert_eq!(payload.new, Some(Map::new()));
    }

    #[test]
    fn test_sentinel_detection() {
        assert!(is_sentinel(""));
        assert!(is_sentinel("  "));
        assert!(is_sentinel("null"));
        assert!(!is_sentinel("42"));
        assert!(!is_sentinel("{\"app\": \"tests\"}"));
    }

    #[test]
    fn test_normalize_passes_declared_fields() {
        let raw: Map<String, Value> =
            serde_json::from_str(r#"{"id": 1, "name": "Billy"}"#).unwrap();
        let normalized = normalize_fields(raw, &["id", "name"], &[]);
        assert_eq!(normalized.len(), 2);
    }

    #[test]
    fn test_normalize_handles_fk_suffix_both_ways() {
        let raw: Map<String, Value> =
            serde_json::from_str(r#"{"author_id": 3, "media": 9}"#).unwrap();
        let normalized = normalize_fields(raw, &["author", "media_id"], &[]);
        assert_eq!(normalized.get("author"), Some(&Value::from(3)));
        assert_eq!(normalized.get("media_id"), Some(&Value::from(9)));
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct FuzzChannel {
        id: i64,
        name: String,
        score: Option<i32>,
        tags: Vec<String>,
    }

    proptest! {
        #[test]
        fn prop_kwargs_round_trip(
            id in any::<i64>(),
            name in "[\\PC]{0,32}",
            score in any::<Option<i32>>(),
            tags in proptest::collection::vec("[a-z]{1,8}", 0..4),
        ) {
            let channel = FuzzChannel { id, name, score, tags };
            let decoded: FuzzChannel =
                decode_kwargs(&encode_kwargs(&channel).unwrap()).unwrap();
            prop_assert_eq!(channel, decoded);
        }
    }

    #[test]
    fn test_normalize_applies_renames_and_drops_unknown() {
        let raw: Map<String, Value> =
            serde_json::from_str(r#"{"picture": 5, "other": "x", "legacy_col": true}"#).unwrap();
        let normalized = normalize_fields(
            raw,
            &["profile_picture_id", "alternative_name"],
            &[("picture", "profile_picture_id"), ("other", "alternative_name")],
        );
        assert_eq!(normalized.get("profile_picture_id"), Some(&Value::from(5)));
        assert_eq!(
            normalized.get("alternative_name"),
            Some(&Value::from("x"))
        );
        assert!(!normalized.contains_key("legacy_col"));
    }
}
