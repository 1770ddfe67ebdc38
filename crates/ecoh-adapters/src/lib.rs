//! Record transform contract + the data-driven field mappings for every
//! harvested source.

pub mod registry;

use chrono::NaiveDateTime;
use ecoh_core::{
    decode_embedded, scalar_key, EmbeddedDoc, EmbeddedDocError, IdentityKey, NormalizedRecord,
    EMBEDDED_FIELD, NODE_ID_FIELD, PERIOD_FIELD, UNKNOWN,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

pub use registry::{CategoryEntry, CategoryPlan, EndpointEntry, EndpointRegistry, PlannedEndpoint, RegistryError};

pub const CRATE_NAME: &str = "ecoh-adapters";

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformContext {
    pub harvested_at: NaiveDateTime,
}

impl TransformContext {
    pub fn now() -> Self {
        Self {
            harvested_at: chrono::Local::now().naive_local(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteSeverity {
    Info,
    Warn,
    Error,
}

/// Something the caller should log about one transformed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformNote {
    pub severity: NoteSeverity,
    pub message: String,
}

impl TransformNote {
    fn info(message: impl Into<String>) -> Self {
        Self {
            severity: NoteSeverity::Info,
            message: message.into(),
        }
    }

    fn warn(message: impl Into<String>) -> Self {
        Self {
            severity: NoteSeverity::Warn,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: NoteSeverity::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub record: NormalizedRecord,
    pub notes: Vec<TransformNote>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("node {title:?} has no Nid")]
    MissingIdentity { title: String },
}

/// Pure mapping from one raw node to a normalized record. Implementations
/// must not fail on malformed embedded documents; they degrade and report a
/// note instead.
pub trait RecordTransform: Send + Sync {
    fn transform(
        &self,
        node: &JsonValue,
        ctx: &TransformContext,
    ) -> Result<Transformed, TransformError>;
}

/// One output field: either copied by name or picked from the first present
/// of several source names. Missing values become `"Unknown"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldRule {
    Plain(String),
    Mapped { out: String, from: Vec<String> },
}

impl FieldRule {
    pub fn out(&self) -> &str {
        match self {
            FieldRule::Plain(name) => name,
            FieldRule::Mapped { out, .. } => out,
        }
    }

    pub fn pick(&self, source: &JsonValue) -> JsonValue {
        let found = match self {
            FieldRule::Plain(name) => source.get(name),
            FieldRule::Mapped { from, .. } => from.iter().find_map(|name| source.get(name)),
        };
        found.cloned().unwrap_or_else(|| json!(UNKNOWN))
    }

    fn apply(rules: &[FieldRule], source: &JsonValue, into: &mut Map<String, JsonValue>) {
        for rule in rules {
            into.insert(rule.out().to_string(), rule.pick(source));
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeolocationMode {
    #[default]
    None,
    /// Emit `lat`/`lng` only when the node has a geolocation string.
    WhenPresent,
    /// Always emit `lat`/`lng`, null when unparsable.
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EmbeddedRule {
    /// Decode the embedded list and map every item into `into`.
    List { into: String, items: Vec<FieldRule> },
    /// Flatten the first embedded object onto the record.
    FirstObject { fields: Vec<FieldRule> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformSpec {
    #[serde(default)]
    pub fields: Vec<FieldRule>,
    #[serde(default)]
    pub geolocation: GeolocationMode,
    #[serde(default)]
    pub year: bool,
    #[serde(default)]
    pub embedded: Option<EmbeddedRule>,
}

#[derive(Debug, Clone)]
pub struct FieldMapTransform {
    spec: TransformSpec,
}

impl FieldMapTransform {
    pub fn new(spec: TransformSpec) -> Self {
        Self { spec }
    }

    fn apply_geolocation(&self, node: &JsonValue, body: &mut Map<String, JsonValue>) {
        let raw = node
            .get("field_geolocation")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        let emit = match self.spec.geolocation {
            GeolocationMode::None => false,
            GeolocationMode::WhenPresent => !raw.is_empty(),
            GeolocationMode::Always => true,
        };
        if !emit {
            return;
        }
        let (lat, lng) = match parse_geolocation(raw) {
            Some((lat, lng)) => (json!(lat), json!(lng)),
            None => (JsonValue::Null, JsonValue::Null),
        };
        body.insert("lat".into(), lat);
        body.insert("lng".into(), lng);
    }

    fn apply_embedded(
        &self,
        rule: &EmbeddedRule,
        node: &JsonValue,
        title: &str,
        body: &mut Map<String, JsonValue>,
        notes: &mut Vec<TransformNote>,
    ) {
        let decoded = decode_embedded(node, EMBEDDED_FIELD);
        match rule {
            EmbeddedRule::List { into, items } => {
                let mapped = match decoded {
                    Ok(EmbeddedDoc::Items(values)) => values
                        .iter()
                        .filter_map(|item| {
                            if item.is_object() {
                                let mut out = Map::new();
                                FieldRule::apply(items, item, &mut out);
                                Some(JsonValue::Object(out))
                            } else {
                                notes.push(TransformNote::warn(format!(
                                    "embedded item of {title:?} is not an object: {item}"
                                )));
                                None
                            }
                        })
                        .collect(),
                    Ok(EmbeddedDoc::Empty) => Vec::new(),
                    Ok(EmbeddedDoc::Absent) => {
                        notes.push(TransformNote::info(format!(
                            "{EMBEDDED_FIELD} missing or empty for {title:?}"
                        )));
                        Vec::new()
                    }
                    Err(err) => {
                        notes.push(embedded_failure(title, &err));
                        Vec::new()
                    }
                };
                body.insert(into.clone(), JsonValue::Array(mapped));
            }
            EmbeddedRule::FirstObject { fields } => {
                let first = match decoded {
                    Ok(EmbeddedDoc::Items(values)) => match values.into_iter().next() {
                        Some(object @ JsonValue::Object(_)) => object,
                        Some(other) => {
                            notes.push(TransformNote::warn(format!(
                                "first embedded item of {title:?} is not an object: {other}"
                            )));
                            JsonValue::Null
                        }
                        None => JsonValue::Null,
                    },
                    Ok(EmbeddedDoc::Empty) => {
                        notes.push(TransformNote::info(format!(
                            "{EMBEDDED_FIELD} is an empty document for {title:?}"
                        )));
                        JsonValue::Null
                    }
                    Ok(EmbeddedDoc::Absent) => {
                        notes.push(TransformNote::info(format!(
                            "{EMBEDDED_FIELD} missing or empty for {title:?}"
                        )));
                        JsonValue::Null
                    }
                    Err(err) => {
                        notes.push(embedded_failure(title, &err));
                        JsonValue::Null
                    }
                };
                FieldRule::apply(fields, &first, body);
            }
        }
    }
}

fn embedded_failure(title: &str, err: &EmbeddedDocError) -> TransformNote {
    match err {
        EmbeddedDocError::UnexpectedShape(_) => {
            TransformNote::warn(format!("{EMBEDDED_FIELD} for {title:?}: {err}"))
        }
        _ => TransformNote::error(format!("failed to parse {EMBEDDED_FIELD} for {title:?}: {err}")),
    }
}

impl RecordTransform for FieldMapTransform {
    fn transform(
        &self,
        node: &JsonValue,
        ctx: &TransformContext,
    ) -> Result<Transformed, TransformError> {
        let title = match node.get("title") {
            Some(JsonValue::String(s)) => s.trim().to_string(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => UNKNOWN.to_string(),
        };

        let nid = node
            .get(NODE_ID_FIELD)
            .and_then(scalar_key)
            .ok_or_else(|| TransformError::MissingIdentity {
                title: title.clone(),
            })?;

        let mut notes = Vec::new();
        let mut body = Map::new();
        body.insert("title".into(), json!(title));
        body.insert(NODE_ID_FIELD.into(), node[NODE_ID_FIELD].clone());

        FieldRule::apply(&self.spec.fields, node, &mut body);

        if self.spec.year {
            let period = node
                .get(PERIOD_FIELD)
                .and_then(JsonValue::as_str)
                .unwrap_or(UNKNOWN);
            let year = extract_year(period).unwrap_or_else(|| {
                notes.push(TransformNote::warn(format!(
                    "could not extract a year from {period:?}"
                )));
                UNKNOWN.to_string()
            });
            body.insert("year".into(), json!(year));
        }

        self.apply_geolocation(node, &mut body);

        if let Some(rule) = &self.spec.embedded {
            self.apply_embedded(rule, node, &title, &mut body, &mut notes);
        }

        body.insert(
            "timestamp".into(),
            json!(ctx.harvested_at.format(TIMESTAMP_FORMAT).to_string()),
        );

        Ok(Transformed {
            record: NormalizedRecord::new(IdentityKey::ByNodeId(nid), JsonValue::Object(body)),
            notes,
        })
    }
}

/// Year of a period label: a trailing four-digit token (`"I квартал 2024"`)
/// or the tail of a leading `dd.mm.yyyy` date.
pub fn extract_year(period: &str) -> Option<String> {
    let last = period.split_whitespace().last()?;
    if last.chars().count() == 4 && last.chars().all(|c| c.is_ascii_digit()) {
        return Some(last.to_string());
    }
    if starts_with_dotted_date(period) {
        return period.rsplit('.').next().map(ToString::to_string);
    }
    None
}

fn starts_with_dotted_date(text: &str) -> bool {
    let bytes = text.as_bytes();
    if bytes.len() < 10 {
        return false;
    }
    bytes[..10].iter().enumerate().all(|(i, b)| match i {
        2 | 5 => *b == b'.',
        _ => b.is_ascii_digit(),
    })
}

/// Parse `"Широта <lat> Долгота <lng>"`.
pub fn parse_geolocation(raw: &str) -> Option<(f64, f64)> {
    if !(raw.contains("Широта") && raw.contains("Долгота")) {
        return None;
    }
    let parts: Vec<&str> = raw.split_whitespace().collect();
    let lat = parts.get(1)?.parse::<f64>().ok()?;
    let lng = parts.get(3)?.parse::<f64>().ok()?;
    Some((lat, lng))
}
