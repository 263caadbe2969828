//! Tenant namespaces and chunk identifiers shared by the dense and sparse stores.

use std::collections::BTreeSet;

use serde_json::Value;

use super::vector::Metadata;

pub const TAG_IDS_FIELD: &str = "tag_ids";
pub const CHUNKS_COUNT_FIELD: &str = "chunks_count";
/// Upper bound on a file's chunk fan-out unless configured otherwise.
pub const DEFAULT_MAX_CHUNKS_PER_FILE: u32 = 10_000;

/// Partition every record of `org_id` lives under.
pub fn namespace_for(org_id: i64) -> String {
    format!("org_id_{org_id}#")
}

/// `chunk_number` is 1-based.
pub fn chunk_id(org_id: i64, file_id: &str, chunk_number: u32) -> String {
    format!("{org_id}#{file_id}#{chunk_number}")
}

pub fn chunk_ids(org_id: i64, file_id: &str, chunks_count: u32) -> Vec<String> {
    (1..=chunks_count)
        .map(|number| chunk_id(org_id, file_id, number))
        .collect()
}

/// Reads `chunks_count` from the first chunk's metadata.
///
/// Accepts integers, integral floats and numeric strings; anything else, or a
/// count below one, yields `None`.
pub fn chunks_count_from(metadata: &Metadata) -> Option<u32> {
    let raw = metadata.get(CHUNKS_COUNT_FIELD)?;
    let count = match raw {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|value| value.fract() == 0.0 && *value >= 0.0)
                .map(|value| value as u64)
        }),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }?;

    u32::try_from(count).ok().filter(|count| *count >= 1)
}

/// Tag ids are persisted string-encoded.
pub fn encode_tag_ids(tag_ids: &BTreeSet<i64>) -> Value {
    Value::Array(
        tag_ids
            .iter()
            .map(|tag| Value::String(tag.to_string()))
            .collect(),
    )
}

/// Metadata patch that overwrites `tag_ids` and nothing else.
pub fn tag_patch(tag_ids: &BTreeSet<i64>) -> Metadata {
    let mut patch = Metadata::new();
    patch.insert(TAG_IDS_FIELD.to_string(), encode_tag_ids(tag_ids));
    patch
}
