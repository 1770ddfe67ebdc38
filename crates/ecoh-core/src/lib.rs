//! Core domain model for the ecoh harvester: categories, endpoints, record
//! identity and the embedded sub-document decode step.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "ecoh-core";

/// Placeholder the remote API (and our field mappings) use for missing values.
pub const UNKNOWN: &str = "Unknown";

/// Field carrying the geo-point reference in substance/level collections.
pub const GEO_POINT_FIELD: &str = "field_geo_point";

/// Field carrying the opaque node identifier of primary-entity records.
pub const NODE_ID_FIELD: &str = "Nid";

/// Field carrying the period of a time-series node.
pub const PERIOD_FIELD: &str = "field_period";

/// Field holding a JSON document serialized as a string inside a node.
pub const EMBEDDED_FIELD: &str = "php";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Air,
    Groundwater,
    Radiation,
    Soils,
    Water,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Air,
        Category::Groundwater,
        Category::Radiation,
        Category::Soils,
        Category::Water,
    ];

    /// Directory name under the data root.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Air => "air",
            Category::Groundwater => "groundwater",
            Category::Radiation => "radiation",
            Category::Soils => "soils",
            Category::Water => "water",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(input.trim()))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Suffix convention of persisted collection files (`<endpoint>_<kind>.json`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Data,
    Place,
    Substances,
    Levels,
}

impl CollectionKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            CollectionKind::Data => "data",
            CollectionKind::Place => "place",
            CollectionKind::Substances => "substances",
            CollectionKind::Levels => "levels",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    pub url: String,
    pub kind: CollectionKind,
}

impl EndpointSpec {
    /// Persisted collection name, e.g. `nsmos_substances_substances`.
    pub fn collection_name(&self) -> String {
        format!("{}_{}", self.name, self.kind.suffix())
    }
}

/// How the targets of the fan-out phase are derived for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    /// Scan every `*_<suffix>.json` collection of the category. The geo point
    /// falls back to the record's `Nid` when the record has no geo-point field.
    SuffixScan { suffixes: Vec<CollectionKind> },
    /// Scan only the listed collections, geo-point field only.
    NamedCollections { collections: Vec<String> },
    /// Targets come from one local collection whose records are regrouped per
    /// geo point instead of being fetched remotely.
    RegroupLocal { collection: String },
}

impl DiscoveryStrategy {
    pub fn fetches_remote(&self) -> bool {
        !matches!(self, DiscoveryStrategy::RegroupLocal { .. })
    }
}

/// Identity of a record inside one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdentityKey {
    ByNodeId(String),
    ByPeriod(String),
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::ByNodeId(v) => write!(f, "Nid:{v}"),
            IdentityKey::ByPeriod(v) => write!(f, "period:{v}"),
        }
    }
}

/// Which identity a snapshot uses. Entity collections are keyed by node id,
/// per-target time series by period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityConvention {
    NodeId,
    Period,
}

impl IdentityConvention {
    /// Derive the identity of a persisted value. Period-keyed snapshots store
    /// raw `{ "node": { ... } }` wrappers.
    pub fn key_of(&self, value: &JsonValue) -> Option<IdentityKey> {
        match self {
            IdentityConvention::NodeId => {
                scalar_key(value.get(NODE_ID_FIELD)?).map(IdentityKey::ByNodeId)
            }
            IdentityConvention::Period => value
                .get("node")
                .and_then(|node| node.get(PERIOD_FIELD))
                .and_then(scalar_key)
                .map(IdentityKey::ByPeriod),
        }
    }

    pub fn accepts(&self, key: &IdentityKey) -> bool {
        matches!(
            (self, key),
            (IdentityConvention::NodeId, IdentityKey::ByNodeId(_))
                | (IdentityConvention::Period, IdentityKey::ByPeriod(_))
        )
    }
}

/// String form of a scalar id; numbers keep their decimal rendering.
pub fn scalar_key(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A normalized record plus its identity. Serializes as the bare record body.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    key: IdentityKey,
    body: JsonValue,
}

impl NormalizedRecord {
    pub fn new(key: IdentityKey, body: JsonValue) -> Self {
        Self { key, body }
    }

    pub fn from_value(convention: IdentityConvention, body: JsonValue) -> Option<Self> {
        let key = convention.key_of(&body)?;
        Some(Self { key, body })
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn body(&self) -> &JsonValue {
        &self.body
    }

    pub fn into_body(self) -> JsonValue {
        self.body
    }
}

impl Serialize for NormalizedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.body.serialize(serializer)
    }
}

/// Identifier of a monitoring location that drives one fan-out fetch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeoPointId(String);

impl GeoPointId {
    /// Rejects empty values and the `"Unknown"` sentinel.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == UNKNOWN {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn from_json(value: &JsonValue) -> Option<Self> {
        scalar_key(value).and_then(Self::new)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name-safe rendering: bytes outside `[A-Za-z0-9_-]` are
    /// percent-encoded (`%` included), so distinct ids never share a stem.
    pub fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                stem.push(char::from(byte));
            } else {
                stem.push_str(&format!("%{byte:02X}"));
            }
        }
        stem
    }
}

impl fmt::Display for GeoPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of decoding an embedded serialized sub-document.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddedDoc {
    /// Field missing, null, empty, or the `"Unknown"` placeholder.
    Absent,
    /// Well-formed JSON with no items (`[]` or `{}`).
    Empty,
    /// Decoded items; a single object becomes a one-element list.
    Items(Vec<JsonValue>),
}

impl EmbeddedDoc {
    pub fn into_items(self) -> Vec<JsonValue> {
        match self {
            EmbeddedDoc::Items(items) => items,
            EmbeddedDoc::Absent | EmbeddedDoc::Empty => Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddedDocError {
    #[error("embedded document is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("embedded document is neither a list nor an object: {0}")]
    UnexpectedShape(String),
    #[error("embedded field is not a string")]
    NotText,
}

/// Decode `node[field]`, a JSON document stored as text.
pub fn decode_embedded(node: &JsonValue, field: &str) -> Result<EmbeddedDoc, EmbeddedDocError> {
    let text = match node.get(field) {
        None | Some(JsonValue::Null) => return Ok(EmbeddedDoc::Absent),
        Some(JsonValue::String(text)) => text,
        Some(_) => return Err(EmbeddedDocError::NotText),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == UNKNOWN {
        return Ok(EmbeddedDoc::Absent);
    }

    match serde_json::from_str::<JsonValue>(trimmed)? {
        JsonValue::Array(items) if items.is_empty() => Ok(EmbeddedDoc::Empty),
        JsonValue::Array(items) => Ok(EmbeddedDoc::Items(items)),
        JsonValue::Object(map) if map.is_empty() => Ok(EmbeddedDoc::Empty),
        object @ JsonValue::Object(_) => Ok(EmbeddedDoc::Items(vec![object])),
        other => Err(EmbeddedDocError::UnexpectedShape(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_distinguishes_absent_malformed_and_empty() {
        let absent = json!({ "title": "x" });
        assert_eq!(decode_embedded(&absent, EMBEDDED_FIELD).unwrap(), EmbeddedDoc::Absent);

        let blank = json!({ "php": "" });
        assert_eq!(decode_embedded(&blank, EMBEDDED_FIELD).unwrap(), EmbeddedDoc::Absent);

        let malformed = json!({ "php": "not valid json" });
        assert!(matches!(
            decode_embedded(&malformed, EMBEDDED_FIELD),
            Err(EmbeddedDocError::Malformed(_))
        ));

        let empty = json!({ "php": "[]" });
        assert_eq!(decode_embedded(&empty, EMBEDDED_FIELD).unwrap(), EmbeddedDoc::Empty);
    }

    #[test]
    fn decode_wraps_single_object_and_rejects_scalars() {
        let single = json!({ "php": "{\"field_pdk\":\"0.3\"}" });
        assert_eq!(
            decode_embedded(&single, EMBEDDED_FIELD).unwrap(),
            EmbeddedDoc::Items(vec![json!({ "field_pdk": "0.3" })])
        );

        let list = json!({ "php": "[{\"a\":1},{\"a\":2}]" });
        assert_eq!(decode_embedded(&list, EMBEDDED_FIELD).unwrap().into_items().len(), 2);

        let scalar = json!({ "php": "42" });
        assert!(matches!(
            decode_embedded(&scalar, EMBEDDED_FIELD),
            Err(EmbeddedDocError::UnexpectedShape(_))
        ));
    }

    #[test]
    fn identity_conventions_read_their_own_fields() {
        let entity = json!({ "Nid": 17, "title": "Station" });
        assert_eq!(
            IdentityConvention::NodeId.key_of(&entity),
            Some(IdentityKey::ByNodeId("17".into()))
        );
        assert_eq!(IdentityConvention::Period.key_of(&entity), None);

        let series = json!({ "node": { "field_period": "I квартал 2024", "Nid": "5" } });
        assert_eq!(
            IdentityConvention::Period.key_of(&series),
            Some(IdentityKey::ByPeriod("I квартал 2024".into()))
        );
    }

    #[test]
    fn geo_point_rejects_sentinel_and_encodes_file_stem() {
        assert!(GeoPointId::new("Unknown").is_none());
        assert!(GeoPointId::new("  ").is_none());
        assert_eq!(GeoPointId::from_json(&json!(301)).unwrap().as_str(), "301");
        assert_eq!(GeoPointId::new("a/b c").unwrap().file_stem(), "a%2Fb%20c");
        assert_eq!(GeoPointId::new("5%").unwrap().file_stem(), "5%25");
        assert_eq!(GeoPointId::new("Орша").unwrap().file_stem(), "%D0%9E%D1%80%D1%88%D0%B0");
    }

    #[test]
    fn distinct_geo_points_never_share_a_file_stem() {
        let stems: std::collections::HashSet<String> = ["12 3", "12_3", "12%203", "12/3", "12-3"]
            .into_iter()
            .filter_map(GeoPointId::new)
            .map(|id| id.file_stem())
            .collect();
        assert_eq!(stems.len(), 5);
    }

    #[test]
    fn record_serializes_as_body_only() {
        let record = NormalizedRecord::new(IdentityKey::ByNodeId("1".into()), json!({ "Nid": "1" }));
        assert_eq!(serde_json::to_value(&record).unwrap(), json!({ "Nid": "1" }));
    }

    #[test]
    fn endpoint_collection_name_appends_kind() {
        let spec = EndpointSpec {
            name: "nsmos_substances".into(),
            url: "https://example.test/api/nsmos_substances".into(),
            kind: CollectionKind::Substances,
        };
        assert_eq!(spec.collection_name(), "nsmos_substances_substances");
        assert_eq!(Category::parse("Water"), Some(Category::Water));
    }
}
