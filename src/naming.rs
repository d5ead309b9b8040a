use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use serde_json::Value;

use crate::store::RequestDescriptor;

/// Artifact names longer than this are shortened and uniquified.
const MAX_NAME_LEN: usize = 128;
/// Kept prefix length when shortening; leaves room for `_` plus the
/// nine-digit timestamp suffix within `MAX_NAME_LEN`.
const SHORTENED_PREFIX_LEN: usize = 118;
const TIMESTAMP_SUFFIX_MODULUS: u64 = 1_000_000_000;

/// Characters rejected by common filesystems, replaced with `_` on top of
/// `.`, whitespace, `@`, and control characters.
const FILESYSTEM_UNSAFE: &[char] = &['/', '?', '<', '>', '\\', ':', '*', '|', '"'];

/// Derives the human-readable artifact base name for a request: the path with
/// its leading slash stripped, then `key-value` per query parameter, then
/// `key-value` per body field, joined with `_`. Array values are joined with
/// `-`, so multi-value parameter order shows up in the name even though it
/// does not affect matching.
pub fn matcher_name(descriptor: &RequestDescriptor) -> String {
    let path = descriptor
        .path
        .strip_prefix('/')
        .unwrap_or(&descriptor.path);
    let mut components = vec![path.to_owned()];

    for (key, value) in &descriptor.query {
        components.push(format!("{key}-{}", component_value(value)));
    }
    if let Some(Value::Object(fields)) = descriptor.body.as_ref() {
        for (key, value) in fields {
            components.push(format!("{key}-{}", component_value(value)));
        }
    }

    components.join("_")
}

fn component_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(component_value)
            .collect::<Vec<_>>()
            .join("-"),
        other => other.to_string(),
    }
}

/// Replaces every character unsafe for a filesystem entry with `_`.
pub fn sanitize_name(unsafe_name: &str) -> String {
    unsafe_name
        .chars()
        .map(|ch| {
            if ch.is_control()
                || ch.is_whitespace()
                || matches!(ch, '.' | '@')
                || FILESYSTEM_UNSAFE.contains(&ch)
            {
                '_'
            } else {
                ch
            }
        })
        .collect()
}

/// Sanitizes `unsafe_name` and, when it is overlong or collides with the base
/// name (pre-extension) of an existing artifact, replaces it with a shortened
/// prefix plus the low-order nine digits of `now_ms`. Collisions within the
/// same millisecond on identical prefixes remain theoretically possible; the
/// suffix is a heuristic, not a guarantee.
pub fn shorten_and_make_unique<'a, I>(unsafe_name: &str, existing_names: I, now_ms: u64) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let name = sanitize_name(unsafe_name);
    let collides = existing_names
        .into_iter()
        .any(|existing| artifact_base_name(existing) == name);

    if name.chars().count() > MAX_NAME_LEN || collides {
        let prefix: String = name.chars().take(SHORTENED_PREFIX_LEN).collect();
        format!("{prefix}_{:09}", now_ms % TIMESTAMP_SUFFIX_MODULUS)
    } else {
        name
    }
}

/// The artifact name up to its first `.`, the portion the collision check
/// compares against freshly generated (extension-free) names.
pub fn artifact_base_name(artifact_name: &str) -> &str {
    artifact_name
        .split('.')
        .next()
        .unwrap_or(artifact_name)
}

/// Maps a live response content type to the artifact file extension.
pub fn artifact_extension(content_type: Option<&str>) -> &'static str {
    if is_json_content_type(content_type) {
        ".json"
    } else {
        ""
    }
}

pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let Some((_, subtype)) = essence.split_once('/') else {
        return false;
    };
    subtype == "json" || subtype.ends_with("+json")
}

pub fn now_unix_ms() -> anyhow::Result<u64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time before unix epoch")?;
    Ok(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
