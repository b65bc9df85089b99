//! Tool result normalization.
//!
//! Tool servers return heterogeneous payloads: structured objects, content
//! lists, free-form text.  This module converts them into one record shaped
//! `{results, meta_data?, returned_file_names?, returned_file_count?}` for
//! LLM consumption, and extracts artifacts and a display hint as
//! side-channel outputs for the UI.  Base64 artifact bytes never appear in
//! the LLM-visible payload.
//!
//! Normalization is idempotent: feeding an already-normalized payload back
//! in yields the same payload.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use parley_kernel::{Artifact, DisplayConfig};

use crate::protocol::{CallToolResult, ContentItem};

/// Size guard for the whole-object results fallback.
const RESULTS_SIZE_LIMIT: usize = 8000;

/// Size guard for metadata blobs.
const META_SIZE_LIMIT: usize = 4000;

/// Image MIME types accepted as artifacts.
const ALLOWED_IMAGE_MIMES: [&str; 6] = [
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/svg+xml",
    "image/webp",
    "image/bmp",
];

/// Keys pruned from the whole-object fallback: large or binary fields that
/// must not reach the LLM inline.
const PRUNE_KEYS: [&str; 2] = ["returned_file_contents", "artifacts"];

/// The uniform output of normalization.
#[derive(Debug, Clone)]
pub struct NormalizedResult {
    /// The record future LLM turns see, always containing a `results` (or
    /// `results_summary`) field.
    pub payload: Value,

    /// Binary artifacts extracted from the raw result.
    pub artifacts: Vec<Artifact>,

    /// Canvas hint, explicit or auto-created for the first image.
    pub display: Option<DisplayConfig>,

    /// Structured metadata for the [`parley_kernel::ToolResult`] record.
    pub meta_data: Option<Value>,
}

/// Normalize a raw tool-server result.
pub fn normalize_tool_result(tool_name: &str, raw: &CallToolResult) -> NormalizedResult {
    let structured = extract_structured(raw);

    let payload = build_payload(&structured);
    let (mut artifacts, mut display) = extract_declared_artifacts(&structured);
    let meta_data = structured
        .as_ref()
        .and_then(|s| s.get("meta_data"))
        .filter(|m| m.is_object())
        .cloned();

    extract_image_artifacts(tool_name, raw, &mut artifacts, &mut display);

    NormalizedResult {
        payload,
        artifacts,
        display,
        meta_data,
    }
}

// ---------------------------------------------------------------------------
// Structured extraction
// ---------------------------------------------------------------------------

/// Pull a structured object out of the raw result, in priority order:
/// structured content, the `data` convenience field, then the concatenated
/// text content (parsed as JSON when possible).
fn extract_structured(raw: &CallToolResult) -> Option<Value> {
    if let Some(sc) = &raw.structured_content
        && sc.is_object()
    {
        return Some(sc.clone());
    }
    if let Some(data) = &raw.data
        && data.is_object()
    {
        return Some(data.clone());
    }

    let text_parts: Vec<&str> = raw
        .content
        .iter()
        .filter_map(|item| match item {
            ContentItem::Text { text } if !text.is_empty() => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if text_parts.is_empty() {
        return None;
    }
    let combined = text_parts.join("\n");

    let trimmed = combined.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        match serde_json::from_str::<Value>(&combined) {
            Ok(Value::Object(map)) => return Some(Value::Object(map)),
            Ok(other) => return Some(json!({"results": other})),
            Err(_) => {}
        }
    }
    Some(json!({"results": combined}))
}

/// Build the `{results, ...}` payload from the structured object.
fn build_payload(structured: &Option<Value>) -> Value {
    let Some(Value::Object(structured)) = structured else {
        return json!({"results": ""});
    };

    let mut payload = Map::new();

    // Support both correct and legacy key forms.
    let results = non_null(structured.get("results")).or_else(|| non_null(structured.get("result")));
    if let Some(results) = results {
        payload.insert("results".into(), results.clone());
    }

    let meta = non_null(structured.get("meta_data"))
        .or_else(|| non_null(structured.get("meta-data")))
        .or_else(|| non_null(structured.get("metadata")));
    if let Some(meta) = meta {
        match serde_json::to_string(meta) {
            Ok(serialized) if serialized.len() < META_SIZE_LIMIT => {
                payload.insert("meta_data".into(), meta.clone());
            }
            Ok(_) => {
                payload.insert("meta_data_truncated".into(), Value::Bool(true));
            }
            Err(_) => {
                payload.insert("meta_data_parse_error".into(), Value::Bool(true));
            }
        }
    }

    if let Some(names) = non_null(structured.get("returned_file_names")) {
        payload.insert("returned_file_names".into(), names.clone());
    }
    if let Some(contents) = non_null(structured.get("returned_file_contents")) {
        let count = contents.as_array().map_or(1, Vec::len);
        payload.insert("returned_file_count".into(), json!(count));
    }

    // Idempotence passthrough: an already-normalized payload may carry
    // these instead of raw inputs.
    for key in ["results_summary", "meta_data_truncated", "returned_file_count"] {
        if !payload.contains_key(key)
            && let Some(v) = non_null(structured.get(key))
        {
            payload.insert(key.into(), v.clone());
        }
    }

    // Fallback: no explicit results key, so the whole structured object
    // (minus large/binary fields) becomes the results, size-guarded.
    if !payload.contains_key("results") && !payload.contains_key("results_summary") {
        let pruned: Map<String, Value> = structured
            .iter()
            .filter(|(k, _)| !PRUNE_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        match serde_json::to_string(&pruned) {
            Ok(serialized) if serialized.len() <= RESULTS_SIZE_LIMIT => {
                payload.insert("results".into(), Value::Object(pruned));
            }
            Ok(serialized) => {
                payload.insert(
                    "results_summary".into(),
                    json!({
                        "keys": pruned.keys().collect::<Vec<_>>(),
                        "omitted_due_to_size": serialized.len(),
                    }),
                );
            }
            Err(_) => {
                payload.insert("results".into(), json!(format!("{pruned:?}")));
            }
        }
    }

    Value::Object(payload)
}

fn non_null(v: Option<&Value>) -> Option<&Value> {
    v.filter(|v| !v.is_null())
}

// ---------------------------------------------------------------------------
// Artifact extraction
// ---------------------------------------------------------------------------

/// Artifacts and display hint declared in the structured object.
fn extract_declared_artifacts(
    structured: &Option<Value>,
) -> (Vec<Artifact>, Option<DisplayConfig>) {
    let mut artifacts = Vec::new();
    let mut display = None;

    let Some(structured) = structured else {
        return (artifacts, display);
    };

    if let Some(declared) = structured.get("artifacts").and_then(Value::as_array) {
        for art in declared {
            let name = art.get("name").and_then(Value::as_str);
            let b64 = art.get("b64").and_then(Value::as_str);
            // Both name and payload are required; partial artifacts are
            // dropped rather than guessed at.
            let (Some(name), Some(b64)) = (name, b64) else {
                continue;
            };
            artifacts.push(Artifact {
                name: name.to_owned(),
                b64: b64.to_owned(),
                mime: art.get("mime").and_then(Value::as_str).map(str::to_owned),
                viewer: art.get("viewer").and_then(Value::as_str).map(str::to_owned),
                description: art
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            });
        }
    }

    if let Some(disp) = structured.get("display").filter(|d| d.is_object()) {
        display = serde_json::from_value(disp.clone()).ok();
    }

    (artifacts, display)
}

/// Scan the content list for image items and turn each valid one into an
/// artifact.  The first image auto-opens the canvas when no explicit
/// display was provided.
fn extract_image_artifacts(
    tool_name: &str,
    raw: &CallToolResult,
    artifacts: &mut Vec<Artifact>,
    display: &mut Option<DisplayConfig>,
) {
    let mut image_counter = 0usize;

    for item in &raw.content {
        let ContentItem::Image { data, mime_type } = item else {
            continue;
        };

        if !ALLOWED_IMAGE_MIMES.contains(&mime_type.as_str()) {
            tracing::warn!(mime = %mime_type, "skipping image content with unsupported mime type");
            continue;
        }
        if BASE64.decode(data).is_err() {
            tracing::warn!("skipping image content with invalid base64 data");
            continue;
        }

        let ext = mime_type.split('/').next_back().unwrap_or("bin");
        let filename = format!("mcp_image_{image_counter}.{ext}");

        artifacts.push(Artifact {
            name: filename.clone(),
            b64: data.clone(),
            mime: Some(mime_type.clone()),
            viewer: Some("image".to_owned()),
            description: Some(format!("Image returned by {tool_name}")),
        });
        tracing::debug!(artifact = %filename, mime = %mime_type, "extracted image content as artifact");

        if display.is_none() && image_counter == 0 {
            *display = Some(DisplayConfig {
                primary_file: filename,
                open_canvas: true,
            });
        }
        image_counter += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn text_result(text: &str) -> CallToolResult {
        CallToolResult {
            content: vec![ContentItem::Text {
                text: text.to_owned(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn structured_results_key_preferred() {
        let raw = CallToolResult {
            structured_content: Some(json!({"results": {"rows": 3}, "meta_data": {"ms": 12}})),
            ..Default::default()
        };
        let normalized = normalize_tool_result("db_query", &raw);
        assert_eq!(normalized.payload["results"]["rows"], 3);
        assert_eq!(normalized.payload["meta_data"]["ms"], 12);
    }

    #[test]
    fn legacy_result_key_accepted() {
        let raw = CallToolResult {
            structured_content: Some(json!({"result": 42, "metadata": {"unit": "s"}})),
            ..Default::default()
        };
        let normalized = normalize_tool_result("t", &raw);
        assert_eq!(normalized.payload["results"], 42);
        assert_eq!(normalized.payload["meta_data"]["unit"], "s");
    }

    #[test]
    fn text_content_parsed_as_json_object() {
        let raw = text_result(r#"{"results": "four"}"#);
        let normalized = normalize_tool_result("t", &raw);
        assert_eq!(normalized.payload["results"], "four");
    }

    #[test]
    fn plain_text_becomes_results() {
        let raw = text_result("the answer is four");
        let normalized = normalize_tool_result("t", &raw);
        assert_eq!(normalized.payload["results"], "the answer is four");
    }

    #[test]
    fn multiple_text_items_concatenated() {
        let raw = CallToolResult {
            content: vec![
                ContentItem::Text {
                    text: "line one".into(),
                },
                ContentItem::Text {
                    text: "line two".into(),
                },
            ],
            ..Default::default()
        };
        let normalized = normalize_tool_result("t", &raw);
        assert_eq!(normalized.payload["results"], "line one\nline two");
    }

    #[test]
    fn whole_object_fallback_without_results_key() {
        let raw = CallToolResult {
            structured_content: Some(json!({"status": "ok", "count": 2})),
            ..Default::default()
        };
        let normalized = normalize_tool_result("t", &raw);
        assert_eq!(normalized.payload["results"]["status"], "ok");
        assert_eq!(normalized.payload["results"]["count"], 2);
    }

    #[test]
    fn oversized_fallback_is_summarized() {
        let big = "x".repeat(RESULTS_SIZE_LIMIT + 100);
        let raw = CallToolResult {
            structured_content: Some(json!({"blob": big})),
            ..Default::default()
        };
        let normalized = normalize_tool_result("t", &raw);
        assert!(normalized.payload.get("results").is_none());
        let summary = &normalized.payload["results_summary"];
        assert_eq!(summary["keys"][0], "blob");
        assert!(summary["omitted_due_to_size"].as_u64().unwrap() > RESULTS_SIZE_LIMIT as u64);
    }

    #[test]
    fn oversized_metadata_is_dropped() {
        let big_meta = json!({"payload": "m".repeat(META_SIZE_LIMIT + 1)});
        let raw = CallToolResult {
            structured_content: Some(json!({"results": 1, "meta_data": big_meta})),
            ..Default::default()
        };
        let normalized = normalize_tool_result("t", &raw);
        assert!(normalized.payload.get("meta_data").is_none());
        assert_eq!(normalized.payload["meta_data_truncated"], true);
    }

    #[test]
    fn returned_file_fields() {
        let raw = CallToolResult {
            structured_content: Some(json!({
                "results": "ok",
                "returned_file_names": ["a.csv", "b.csv"],
                "returned_file_contents": ["...", "..."],
            })),
            ..Default::default()
        };
        let normalized = normalize_tool_result("t", &raw);
        assert_eq!(normalized.payload["returned_file_names"][1], "b.csv");
        assert_eq!(normalized.payload["returned_file_count"], 2);
        // File contents themselves never reach the payload.
        assert!(normalized.payload.get("returned_file_contents").is_none());
    }

    #[test]
    fn declared_artifacts_require_name_and_b64() {
        let raw = CallToolResult {
            structured_content: Some(json!({
                "results": "ok",
                "artifacts": [
                    {"name": "plot.png", "b64": "aGVsbG8=", "mime": "image/png", "viewer": "image"},
                    {"name": "incomplete.bin"},
                ],
            })),
            ..Default::default()
        };
        let normalized = normalize_tool_result("t", &raw);
        assert_eq!(normalized.artifacts.len(), 1);
        assert_eq!(normalized.artifacts[0].name, "plot.png");
        // Binary fields are pruned from the LLM-visible payload.
        assert!(!normalized.payload.to_string().contains("aGVsbG8="));
    }

    #[test]
    fn image_content_auto_opens_canvas() {
        // S6: one valid png image, no explicit display.
        let raw = CallToolResult {
            content: vec![ContentItem::Image {
                data: BASE64.encode(b"png-bytes"),
                mime_type: "image/png".into(),
            }],
            ..Default::default()
        };
        let normalized = normalize_tool_result("chart_render", &raw);

        assert_eq!(normalized.artifacts.len(), 1);
        assert_eq!(normalized.artifacts[0].name, "mcp_image_0.png");
        let display = normalized.display.unwrap();
        assert_eq!(display.primary_file, "mcp_image_0.png");
        assert!(display.open_canvas);
        assert!(!normalized.payload.to_string().contains(&BASE64.encode(b"png-bytes")));
    }

    #[test]
    fn disallowed_mime_and_bad_base64_are_skipped() {
        let raw = CallToolResult {
            content: vec![
                ContentItem::Image {
                    data: BASE64.encode(b"tiff"),
                    mime_type: "image/tiff".into(),
                },
                ContentItem::Image {
                    data: "!!not-base64!!".into(),
                    mime_type: "image/png".into(),
                },
                ContentItem::Image {
                    data: BASE64.encode(b"fine"),
                    mime_type: "image/webp".into(),
                },
            ],
            ..Default::default()
        };
        let normalized = normalize_tool_result("t", &raw);
        assert_eq!(normalized.artifacts.len(), 1);
        assert_eq!(normalized.artifacts[0].name, "mcp_image_0.webp");
    }

    #[test]
    fn explicit_display_wins_over_auto_canvas() {
        let raw = CallToolResult {
            content: vec![ContentItem::Image {
                data: BASE64.encode(b"img"),
                mime_type: "image/png".into(),
            }],
            structured_content: Some(json!({
                "results": "ok",
                "display": {"primary_file": "report.html", "open_canvas": false},
            })),
            ..Default::default()
        };
        let normalized = normalize_tool_result("t", &raw);
        let display = normalized.display.unwrap();
        assert_eq!(display.primary_file, "report.html");
        assert!(!display.open_canvas);
    }

    #[test]
    fn normalization_is_idempotent() {
        let inputs = [
            CallToolResult {
                structured_content: Some(json!({
                    "results": {"rows": [1, 2]},
                    "meta_data": {"ms": 5},
                    "returned_file_names": ["a.txt"],
                })),
                ..Default::default()
            },
            text_result("plain text output"),
            CallToolResult {
                structured_content: Some(json!({"status": "ok"})),
                ..Default::default()
            },
            CallToolResult {
                structured_content: Some(json!({"results": 1, "meta_data": {"big": "m".repeat(5000)}})),
                ..Default::default()
            },
        ];

        for raw in inputs {
            let first = normalize_tool_result("t", &raw);
            let again = normalize_tool_result(
                "t",
                &CallToolResult {
                    structured_content: Some(first.payload.clone()),
                    ..Default::default()
                },
            );
            assert_eq!(first.payload, again.payload);
        }
    }

    #[test]
    fn empty_result_still_produces_results_field() {
        let normalized = normalize_tool_result("t", &CallToolResult::default());
        assert_eq!(normalized.payload["results"], "");
        assert!(normalized.artifacts.is_empty());
    }
}
