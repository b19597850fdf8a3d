//! Typed records and views.
//!
//! A canonical spec tree is decomposed into a closed set of record variants,
//! one per retrievable OpenAPI construct. Fields the model does not know
//! about (vendor `x-*` keys and anything else) travel with the record in
//! [`Record::extensions`] instead of being discarded.
//!
//! Every record renders to a plain-text page ([`Record::render`]) that is
//! fed to the LLM prompts and doubles as the fallback view when no
//! generated view exists.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::resolve::{reference_name, CYCLE_MARKER, REF_ANNOTATION, UNRESOLVED_MARKER};

/// Upper bound on the pretty-printed schema JSON embedded in record text.
pub const MAX_SCHEMA_CHARS: usize = 4000;

// ============ Kinds ============

/// The kind of a semantic view of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    /// Plain-language summary written by the LLM.
    Summary,
    /// Anticipated user questions written by the LLM.
    Question,
    /// Example invocation synthesized from the record's schemas.
    Example,
    /// Raw record text, used only when no other view exists.
    Metadata,
}

impl ViewKind {
    /// Kinds that can be requested for a build.
    pub const GENERATED: [ViewKind; 3] = [ViewKind::Summary, ViewKind::Question, ViewKind::Example];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewKind::Summary => "summary",
            ViewKind::Question => "question",
            ViewKind::Example => "example",
            ViewKind::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "summary" => Some(ViewKind::Summary),
            "question" | "questions" => Some(ViewKind::Question),
            "example" | "examples" => Some(ViewKind::Example),
            "metadata" => Some(ViewKind::Metadata),
            _ => None,
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ViewKind::parse(s).ok_or_else(|| {
            format!(
                "unknown view kind '{}' (expected summary, question or example)",
                s
            )
        })
    }
}

/// Discriminant of [`RecordBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Operation,
    Parameter,
    RequestBody,
    Response,
    Schema,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Operation => "operation",
            RecordKind::Parameter => "parameter",
            RecordKind::RequestBody => "request_body",
            RecordKind::Response => "response",
            RecordKind::Schema => "schema",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a parameter travels in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
    /// Swagger 2 form field.
    FormData,
}

impl ParamLocation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "path" => Some(ParamLocation::Path),
            "query" => Some(ParamLocation::Query),
            "header" => Some(ParamLocation::Header),
            "cookie" => Some(ParamLocation::Cookie),
            "formData" => Some(ParamLocation::FormData),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamLocation::Path => "path",
            ParamLocation::Query => "query",
            ParamLocation::Header => "header",
            ParamLocation::Cookie => "cookie",
            ParamLocation::FormData => "formData",
        }
    }
}

impl fmt::Display for ParamLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Record variants ============

/// A schema as it appears under a parameter, body or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRef {
    /// Name of the component the schema was inlined from, if any.
    pub name: Option<String>,
    /// Short type label, e.g. `array<Pet>`.
    pub type_name: String,
    /// The dereferenced schema subtree.
    pub schema: Value,
}

impl SchemaRef {
    pub fn from_schema(schema: &Value) -> Self {
        Self {
            name: schema_name(schema),
            type_name: type_label(schema),
            schema: schema.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Upper-case HTTP method.
    pub method: String,
    pub path: String,
    pub operation_id: Option<String>,
    pub tags: Vec<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub base_urls: Vec<String>,
    pub deprecated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    pub description: Option<String>,
    pub schema: Option<SchemaRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBodyRecord {
    /// Preferred media type (JSON first when offered).
    pub content_type: Option<String>,
    pub content_types: Vec<String>,
    pub required: bool,
    pub description: Option<String>,
    pub schema: Option<SchemaRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    /// Status code as written (`200`, `4XX`, `default`).
    pub status: String,
    pub content_type: Option<String>,
    pub description: Option<String>,
    pub schema: Option<SchemaRef>,
}

/// One property line of a [`SchemaRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySummary {
    pub name: String,
    pub type_name: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub name: String,
    pub title: Option<String>,
    pub type_shape: String,
    pub description: Option<String>,
    pub properties: Vec<PropertySummary>,
    pub schema: Value,
}

/// Closed set of record variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordBody {
    Operation(OperationRecord),
    Parameter(ParameterRecord),
    RequestBody(RequestBodyRecord),
    Response(ResponseRecord),
    Schema(SchemaRecord),
}

/// Metadata common to every record, used for filtering and citation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub method: Option<String>,
    pub path: Option<String>,
    pub operation_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status_code: Option<String>,
    pub param_in: Option<ParamLocation>,
    pub schema_name: Option<String>,
}

/// One retrievable unit of the spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Deterministic identifier, stable across runs on an unchanged spec.
    pub id: String,
    /// Owning operation for parameter, request body and response records.
    pub parent: Option<String>,
    pub meta: RecordMeta,
    pub body: RecordBody,
    /// Deterministic example text (curl call or JSON instance).
    pub example: Option<String>,
    /// Fields of the source object the model does not capture.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match &self.body {
            RecordBody::Operation(_) => RecordKind::Operation,
            RecordBody::Parameter(_) => RecordKind::Parameter,
            RecordBody::RequestBody(_) => RecordKind::RequestBody,
            RecordBody::Response(_) => RecordKind::Response,
            RecordBody::Schema(_) => RecordKind::Schema,
        }
    }

    /// Short human label used when citing a record, e.g. `GET /pets/{id}/200`.
    pub fn label(&self) -> String {
        let endpoint = match (&self.meta.method, &self.meta.path) {
            (Some(m), Some(p)) => format!("{} {}", m, p),
            _ => String::new(),
        };
        match &self.body {
            RecordBody::Operation(_) => endpoint,
            RecordBody::Parameter(p) => format!("{} ({} {})", endpoint, p.location, p.name),
            RecordBody::RequestBody(_) => format!("{} body", endpoint),
            RecordBody::Response(r) => format!("{}/{}", endpoint, r.status),
            RecordBody::Schema(s) => format!("schema {}", s.name),
        }
    }

    /// Plain-text page for prompts and the fallback view.
    pub fn render(&self) -> String {
        let endpoint = format!(
            "{} {}",
            self.meta.method.as_deref().unwrap_or(""),
            self.meta.path.as_deref().unwrap_or("")
        );
        let mut lines: Vec<String> = Vec::new();
        match &self.body {
            RecordBody::Operation(op) => {
                lines.push(format!("OPERATION: {} {}", op.method, op.path));
                lines.push(format!(
                    "OPERATION_ID: {}",
                    op.operation_id.as_deref().unwrap_or("N/A")
                ));
                lines.push(format!("TAGS: {}", or_na(&op.tags.join(", "))));
                lines.push(format!("SUMMARY: {}", op.summary.as_deref().unwrap_or("N/A")));
                lines.push("DESCRIPTION:".to_string());
                lines.push(op.description.clone().unwrap_or_else(|| "N/A".into()));
                lines.push(format!("BASE_URLS: {}", or_na(&op.base_urls.join(", "))));
                if op.deprecated {
                    lines.push("DEPRECATED: true".to_string());
                }
            }
            RecordBody::Parameter(p) => {
                lines.push("PARAMETER".to_string());
                lines.push(format!("for: {}", endpoint));
                lines.push(format!("name: {}", p.name));
                lines.push(format!("in: {}", p.location));
                lines.push(format!("required: {}", p.required));
                lines.push(format!("description: {}", p.description.as_deref().unwrap_or("")));
                push_schema(&mut lines, p.schema.as_ref());
            }
            RecordBody::RequestBody(b) => {
                lines.push("REQUEST BODY".to_string());
                lines.push(format!("for: {}", endpoint));
                lines.push(format!("required: {}", b.required));
                lines.push(format!("content types: {}", or_na(&b.content_types.join(", "))));
                if let Some(desc) = &b.description {
                    lines.push(format!("description: {}", desc));
                }
                push_schema(&mut lines, b.schema.as_ref());
            }
            RecordBody::Response(r) => {
                lines.push("RESPONSE".to_string());
                lines.push(format!("for: {}", endpoint));
                lines.push(format!("status: {}", r.status));
                lines.push(format!("description: {}", r.description.as_deref().unwrap_or("")));
                if let Some(ct) = &r.content_type {
                    lines.push(format!("content type: {}", ct));
                }
                push_schema(&mut lines, r.schema.as_ref());
            }
            RecordBody::Schema(s) => {
                lines.push("SCHEMA".to_string());
                lines.push(format!("name: {}", s.name));
                lines.push(format!("title: {}", s.title.as_deref().unwrap_or(&s.name)));
                lines.push(format!("type: {}", s.type_shape));
                lines.push("description:".to_string());
                lines.push(s.description.clone().unwrap_or_default());
                if !s.properties.is_empty() {
                    lines.push("properties:".to_string());
                    for prop in &s.properties {
                        let req = if prop.required { " (required)" } else { "" };
                        lines.push(format!("  - {}: {}{}", prop.name, prop.type_name, req));
                    }
                }
                lines.push("schema_json:".to_string());
                lines.push(truncated_json(&s.schema));
            }
        }
        lines.join("\n")
    }

    /// Flat metadata object stored next to every vector, empty values dropped.
    pub fn metadata_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("kind".into(), json!(self.kind().as_str()));
        map.insert("record_id".into(), json!(self.id));
        insert_opt(&mut map, "parent_id", self.parent.as_deref());
        insert_opt(&mut map, "method", self.meta.method.as_deref());
        insert_opt(&mut map, "path", self.meta.path.as_deref());
        insert_opt(&mut map, "operationId", self.meta.operation_id.as_deref());
        if !self.meta.tags.is_empty() {
            map.insert("tags".into(), json!(self.meta.tags));
        }
        insert_opt(&mut map, "status_code", self.meta.status_code.as_deref());
        insert_opt(
            &mut map,
            "param_in",
            self.meta.param_in.as_ref().map(|l| l.as_str()),
        );
        insert_opt(&mut map, "schema_name", self.meta.schema_name.as_deref());
        if let RecordBody::Parameter(p) = &self.body {
            map.insert("param_name".into(), json!(p.name));
            map.insert("required".into(), json!(p.required));
        }
        Value::Object(map)
    }
}

fn or_na(s: &str) -> &str {
    if s.is_empty() {
        "N/A"
    } else {
        s
    }
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        map.insert(key.to_string(), json!(v));
    }
}

fn push_schema(lines: &mut Vec<String>, schema: Option<&SchemaRef>) {
    match schema {
        Some(s) => {
            match &s.name {
                Some(name) => lines.push(format!("schema: {} ({})", s.type_name, name)),
                None => lines.push(format!("schema: {}", s.type_name)),
            }
            lines.push(truncated_json(&s.schema));
        }
        None => lines.push("schema: N/A".to_string()),
    }
}

/// Pretty JSON cut at [`MAX_SCHEMA_CHARS`] on a char boundary.
pub fn truncated_json(value: &Value) -> String {
    let text = serde_json::to_string_pretty(value).unwrap_or_default();
    if text.chars().count() <= MAX_SCHEMA_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(MAX_SCHEMA_CHARS).collect();
    cut.push_str("\n... (truncated)");
    cut
}

// ============ Schema helpers ============

/// Name of the component a schema was inlined from, or the cycle target.
pub fn schema_name(schema: &Value) -> Option<String> {
    let obj = schema.as_object()?;
    for key in [REF_ANNOTATION, CYCLE_MARKER] {
        if let Some(r) = obj.get(key).and_then(Value::as_str) {
            return Some(reference_name(r));
        }
    }
    None
}

/// Compact type label: `string(date-time)`, `array<Pet>`, `oneOf<Cat|Dog>`.
pub fn type_label(schema: &Value) -> String {
    let obj = match schema.as_object() {
        Some(o) => o,
        None => return "any".to_string(),
    };
    if let Some(r) = obj.get(CYCLE_MARKER).and_then(Value::as_str) {
        return reference_name(r);
    }
    if obj.contains_key(UNRESOLVED_MARKER) {
        return "unresolved".to_string();
    }
    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(Value::Array(items)) = obj.get(combinator) {
            let parts: Vec<String> = items
                .iter()
                .map(|item| schema_name(item).unwrap_or_else(|| type_label(item)))
                .collect();
            return format!("{}<{}>", combinator, parts.join("|"));
        }
    }
    let ty = match obj.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .unwrap_or("any")
            .to_string(),
        _ if obj.contains_key("properties") => "object".to_string(),
        _ if obj.contains_key("items") => "array".to_string(),
        _ => "any".to_string(),
    };
    match ty.as_str() {
        "array" => {
            let inner = obj
                .get("items")
                .map(|items| schema_name(items).unwrap_or_else(|| type_label(items)))
                .unwrap_or_else(|| "any".to_string());
            format!("array<{}>", inner)
        }
        _ => match obj.get("format").and_then(Value::as_str) {
            Some(format) => format!("{}({})", ty, format),
            None => ty,
        },
    }
}

/// Property lines of an object schema, in declaration order.
pub fn property_summaries(schema: &Value) -> Vec<PropertySummary> {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| {
            props
                .iter()
                .map(|(name, prop)| PropertySummary {
                    name: name.clone(),
                    type_name: schema_name(prop).unwrap_or_else(|| type_label(prop)),
                    required: required.contains(&name.as_str()),
                })
                .collect()
        })
        .unwrap_or_default()
}

// ============ Views ============

/// One text representation of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub record_id: String,
    pub kind: ViewKind,
    pub text: String,
}

impl View {
    pub fn new(record_id: impl Into<String>, kind: ViewKind, text: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            kind,
            text: text.into(),
        }
    }

    pub fn id(&self) -> String {
        view_id(&self.record_id, self.kind)
    }
}

/// `<record-id>::<kind>`.
pub fn view_id(record_id: &str, kind: ViewKind) -> String {
    format!("{}::{}", record_id, kind)
}
