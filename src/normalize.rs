//! Response normalization.
//!
//! Backend records use `false` as an empty marker and `[id, name]` pairs for
//! many2one references. Normalization turns them into LLM-friendly JSON:
//! `{id, name}` objects, `""`/`null` empties typed by field, RFC3339
//! datetimes, stripped HTML and no binary payloads unless asked for.
//! The transform is idempotent: running it twice changes nothing.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::registry::{FieldType, ModelInfo};

#[derive(Clone, Copy, Debug)]
pub struct NormalizeOptions {
    pub strip_html: bool,
    pub normalize_relational: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            strip_html: true,
            normalize_relational: true,
        }
    }
}

static DATETIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}) (\d{2}:\d{2}:\d{2})$")
        .unwrap_or_else(|e| panic!("invalid datetime regex: {e}"))
});

/// Normalize one record. `requested` lists fields the caller explicitly
/// asked for; binary fields outside it are dropped.
pub fn normalize_record(
    record: Value,
    model: Option<&ModelInfo>,
    requested: Option<&[String]>,
    options: NormalizeOptions,
) -> Value {
    let Value::Object(map) = record else {
        return record;
    };
    let requested: Option<HashSet<&str>> =
        requested.map(|fields| fields.iter().map(String::as_str).collect());

    let mut out = Map::with_capacity(map.len());
    for (name, value) in map {
        let field_type = model.and_then(|m| m.fields.get(&name)).map(|f| f.field_type);

        if field_type == Some(FieldType::Binary)
            && !requested.as_ref().is_some_and(|r| r.contains(name.as_str()))
        {
            continue;
        }
        out.insert(name, normalize_value(value, field_type, options));
    }
    Value::Object(out)
}

/// Normalize every record of a `search_read`/`read` result.
pub fn normalize_records(
    records: Value,
    model: Option<&ModelInfo>,
    requested: Option<&[String]>,
    options: NormalizeOptions,
) -> Value {
    match records {
        Value::Array(rows) => Value::Array(
            rows.into_iter()
                .map(|row| normalize_record(row, model, requested, options))
                .collect(),
        ),
        other => normalize_record(other, model, requested, options),
    }
}

fn normalize_value(value: Value, field_type: Option<FieldType>, options: NormalizeOptions) -> Value {
    // Relational [id, name] pairs become objects regardless of metadata.
    if options.normalize_relational {
        if let Some(pair) = as_reference_pair(&value) {
            return pair;
        }
    }

    match (&value, field_type) {
        // Empty marker, typed.
        (Value::Bool(false), Some(FieldType::Char | FieldType::Text | FieldType::Html)) => {
            json!("")
        }
        (Value::Bool(false), Some(FieldType::Date | FieldType::Datetime)) => Value::Null,
        (
            Value::Bool(false),
            Some(FieldType::Many2one | FieldType::Reference),
        ) => Value::Null,
        (Value::String(s), Some(FieldType::Datetime)) => normalize_datetime(s),
        (Value::String(s), Some(FieldType::Html)) if options.strip_html => {
            json!(strip_html(s))
        }
        (Value::String(s), None) => {
            // Untyped strings still get the datetime shape fixed.
            if DATETIME_RE.is_match(s) {
                normalize_datetime(s)
            } else {
                value
            }
        }
        _ => value,
    }
}

fn as_reference_pair(value: &Value) -> Option<Value> {
    let pair = value.as_array()?;
    if pair.len() != 2 {
        return None;
    }
    let id = pair[0].as_i64()?;
    let name = pair[1].as_str()?;
    Some(json!({"id": id, "name": name}))
}

fn normalize_datetime(raw: &str) -> Value {
    match DATETIME_RE.captures(raw) {
        Some(caps) => json!(format!("{}T{}Z", &caps[1], &caps[2])),
        None => json!(raw),
    }
}

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap_or_else(|e| panic!("invalid tag regex: {e}")));
static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(?:br\s*/?|/p|/div|/li|/tr|/h[1-6]|/blockquote)>")
        .unwrap_or_else(|e| panic!("invalid block regex: {e}"))
});
static BLANK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").unwrap_or_else(|e| panic!("invalid blank regex: {e}")));

/// Reduce HTML to plain text: block-element closers become newlines, the
/// rest of the markup is dropped, entities are decoded.
pub fn strip_html(html: &str) -> String {
    let with_breaks = BLOCK_RE.replace_all(html, "\n");
    let text = TAG_RE.replace_all(&with_breaks, "");
    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    BLANK_RE.replace_all(&decoded, "\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FieldInfo;
    use std::collections::BTreeMap;

    fn model_with(fields: &[(&str, FieldType)]) -> ModelInfo {
        let fields: BTreeMap<String, FieldInfo> = fields
            .iter()
            .map(|(name, ft)| {
                let attrs = json!({"type": "char"});
                let mut info = FieldInfo::from_wire(name, &attrs).unwrap();
                info.field_type = *ft;
                (name.to_string(), info)
            })
            .collect();
        ModelInfo {
            model: "sale.order".to_string(),
            name: "Sales Order".to_string(),
            description: String::new(),
            transient: false,
            fields,
            methods: BTreeMap::new(),
            states: None,
            parent_models: Vec::new(),
            has_chatter: false,
        }
    }

    #[test]
    fn reference_pairs_become_objects() {
        let model = model_with(&[("partner_id", FieldType::Many2one)]);
        let record = json!({"partner_id": [7, "Acme Corp"]});
        let out = normalize_record(record, Some(&model), None, NormalizeOptions::default());
        assert_eq!(out["partner_id"], json!({"id": 7, "name": "Acme Corp"}));
    }

    #[test]
    fn empty_markers_follow_field_type() {
        let model = model_with(&[
            ("name", FieldType::Char),
            ("date_order", FieldType::Datetime),
            ("partner_id", FieldType::Many2one),
        ]);
        let record = json!({"name": false, "date_order": false, "partner_id": false});
        let out = normalize_record(record, Some(&model), None, NormalizeOptions::default());
        assert_eq!(out["name"], json!(""));
        assert_eq!(out["date_order"], Value::Null);
        assert_eq!(out["partner_id"], Value::Null);
    }

    #[test]
    fn datetimes_become_rfc3339() {
        let model = model_with(&[("date_order", FieldType::Datetime)]);
        let record = json!({"date_order": "2025-03-01 14:30:00"});
        let out = normalize_record(record, Some(&model), None, NormalizeOptions::default());
        assert_eq!(out["date_order"], json!("2025-03-01T14:30:00Z"));
    }

    #[test]
    fn binary_dropped_unless_requested() {
        let model = model_with(&[("image_1920", FieldType::Binary), ("name", FieldType::Char)]);
        let record = json!({"image_1920": "aGVsbG8=", "name": "Acme"});

        let dropped = normalize_record(
            record.clone(),
            Some(&model),
            None,
            NormalizeOptions::default(),
        );
        assert!(dropped.get("image_1920").is_none());

        let requested = vec!["image_1920".to_string()];
        let kept = normalize_record(
            record,
            Some(&model),
            Some(&requested),
            NormalizeOptions::default(),
        );
        assert_eq!(kept["image_1920"], json!("aGVsbG8="));
    }

    #[test]
    fn html_stripped_to_text() {
        let html = "<p>Hello <b>world</b></p><p>Second &amp; third</p>";
        assert_eq!(strip_html(html), "Hello world\nSecond & third");
    }

    #[test]
    fn normalization_is_idempotent() {
        let model = model_with(&[
            ("partner_id", FieldType::Many2one),
            ("name", FieldType::Char),
            ("date_order", FieldType::Datetime),
            ("note", FieldType::Html),
        ]);
        let record = json!({
            "partner_id": [3, "Acme"],
            "name": false,
            "date_order": "2025-03-01 14:30:00",
            "note": "<p>memo</p>",
        });
        let once = normalize_record(
            record,
            Some(&model),
            None,
            NormalizeOptions::default(),
        );
        let twice = normalize_record(
            once.clone(),
            Some(&model),
            None,
            NormalizeOptions::default(),
        );
        assert_eq!(once, twice);
    }

    #[test]
    fn untyped_records_still_normalize_shapes() {
        let record = json!({"partner_id": [3, "Acme"], "when": "2025-01-01 00:00:00"});
        let out = normalize_record(record, None, None, NormalizeOptions::default());
        assert_eq!(out["partner_id"]["name"], json!("Acme"));
        assert_eq!(out["when"], json!("2025-01-01T00:00:00Z"));
    }
}
