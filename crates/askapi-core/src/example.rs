//! Deterministic example synthesis.
//!
//! Example views are derived from the record's own schemas rather than
//! written by the LLM, so every example names the real method and path,
//! substitutes path parameters, and carries a request body of the right
//! shape. Values come from `example`, `default`, `enum` or `const` when the
//! schema provides them and from the type and format otherwise.

use serde_json::{json, Map, Value};
use url::form_urlencoded::byte_serialize;

use crate::model::{OperationRecord, ParamLocation, ParameterRecord, RequestBodyRecord};
use crate::resolve::{CYCLE_MARKER, UNRESOLVED_MARKER};

/// Base URL used when the spec declares no server.
pub const PLACEHOLDER_BASE_URL: &str = "https://api.example.com";

/// Nesting depth after which synthesis stops descending.
const MAX_DEPTH: usize = 6;

/// Which side of the exchange an example is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Only required, writable properties.
    Request,
    /// Every readable property.
    Response,
}

/// Produce an example instance of `schema`.
pub fn example_value(schema: &Value, direction: Direction) -> Value {
    value_at(schema, direction, 0)
}

fn value_at(schema: &Value, direction: Direction, depth: usize) -> Value {
    let obj = match schema.as_object() {
        Some(o) => o,
        None => return Value::Null,
    };
    if obj.contains_key(CYCLE_MARKER) || obj.contains_key(UNRESOLVED_MARKER) {
        return json!({});
    }
    if let Some(example) = obj.get("example") {
        return example.clone();
    }
    if let Some(Value::Array(examples)) = obj.get("examples") {
        if let Some(first) = examples.first() {
            return first.clone();
        }
    }
    for key in ["default", "const"] {
        if let Some(v) = obj.get(key) {
            return v.clone();
        }
    }
    if let Some(first) = obj.get("enum").and_then(Value::as_array).and_then(|e| e.first()) {
        return first.clone();
    }
    if depth >= MAX_DEPTH {
        return Value::Null;
    }

    if let Some(Value::Array(parts)) = obj.get("allOf") {
        let mut merged = Map::new();
        for part in parts {
            if let Value::Object(fields) = value_at(part, direction, depth + 1) {
                merged.extend(fields);
            }
        }
        return Value::Object(merged);
    }
    for combinator in ["oneOf", "anyOf"] {
        if let Some(first) = obj.get(combinator).and_then(Value::as_array).and_then(|a| a.first()) {
            return value_at(first, direction, depth + 1);
        }
    }

    let ty = match obj.get("type") {
        Some(Value::String(t)) => t.as_str(),
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .unwrap_or("null"),
        _ if obj.contains_key("properties") => "object",
        _ if obj.contains_key("items") => "array",
        _ => "object",
    };

    match ty {
        "object" => object_example(obj, direction, depth),
        "array" => match obj.get("items") {
            Some(items) => Value::Array(vec![value_at(items, direction, depth + 1)]),
            None => json!([]),
        },
        "string" => json!(string_example(obj.get("format").and_then(Value::as_str))),
        "integer" => obj
            .get("minimum")
            .filter(|m| m.is_i64() || m.is_u64())
            .cloned()
            .unwrap_or(json!(1)),
        "number" => obj.get("minimum").cloned().unwrap_or(json!(1.5)),
        "boolean" => json!(true),
        _ => Value::Null,
    }
}

fn object_example(obj: &Map<String, Value>, direction: Direction, depth: usize) -> Value {
    let mut out = Map::new();
    let required: Vec<&str> = obj
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        for (name, prop) in props {
            let skip_flag = match direction {
                Direction::Request => "readOnly",
                Direction::Response => "writeOnly",
            };
            if prop.get(skip_flag).and_then(Value::as_bool) == Some(true) {
                continue;
            }
            if direction == Direction::Request
                && !required.is_empty()
                && !required.contains(&name.as_str())
            {
                continue;
            }
            out.insert(name.clone(), value_at(prop, direction, depth + 1));
        }
    } else if let Some(extra @ Value::Object(_)) = obj.get("additionalProperties") {
        out.insert("key".to_string(), value_at(extra, direction, depth + 1));
    }
    Value::Object(out)
}

fn string_example(format: Option<&str>) -> &'static str {
    match format {
        Some("date") => "2024-01-01",
        Some("date-time") => "2024-01-01T00:00:00Z",
        Some("time") => "12:00:00",
        Some("uuid") => "3fa85f64-5717-4562-b3fc-2c963f66afa6",
        Some("email") => "user@example.com",
        Some("uri") | Some("url") => "https://example.com",
        Some("hostname") => "example.com",
        Some("ipv4") => "192.0.2.1",
        Some("ipv6") => "2001:db8::1",
        Some("byte") => "c3RyaW5n",
        Some("binary") => "@file",
        Some("password") => "********",
        _ => "string",
    }
}

/// Scalar rendering for path, query and header positions.
fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "value".to_string(),
        Value::Array(items) => items.iter().map(scalar_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

fn encode(text: &str) -> String {
    byte_serialize(text.as_bytes()).collect()
}

// ============ Example calls ============

/// A runnable HTTP request derived from an operation's schemas.
#[derive(Debug, Clone, PartialEq)]
pub struct ExampleCall {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<ExampleBody>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExampleBody {
    Json(Value),
    Form(Vec<(String, String)>),
    Raw { content_type: String, text: String },
}

impl ExampleCall {
    /// Build the example call for an operation and its child records.
    pub fn for_operation(
        op: &OperationRecord,
        params: &[ParameterRecord],
        body: Option<&RequestBodyRecord>,
    ) -> Self {
        let base = op
            .base_urls
            .first()
            .map(String::as_str)
            .unwrap_or(PLACEHOLDER_BASE_URL)
            .trim_end_matches('/');

        let mut path = op.path.clone();
        let mut query: Vec<(String, String)> = Vec::new();
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut form: Vec<(String, String)> = Vec::new();

        for param in params {
            let value = scalar_text(&param_value(param));
            match param.location {
                ParamLocation::Path => {
                    path = path.replace(&format!("{{{}}}", param.name), &encode(&value));
                }
                ParamLocation::Query if param.required => query.push((param.name.clone(), value)),
                ParamLocation::Header if param.required => headers.push((param.name.clone(), value)),
                ParamLocation::FormData if param.required => form.push((param.name.clone(), value)),
                _ => {}
            }
        }

        let mut url = format!("{}{}", base, path);
        if !query.is_empty() {
            let qs: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
                .collect();
            url.push('?');
            url.push_str(&qs.join("&"));
        }

        let body = match body {
            Some(rb) => Some(request_body(rb)),
            None if !form.is_empty() => Some(ExampleBody::Form(form)),
            None => None,
        };
        match &body {
            Some(ExampleBody::Json(_)) => {
                headers.push(("Content-Type".into(), "application/json".into()))
            }
            Some(ExampleBody::Form(_)) => headers.push((
                "Content-Type".into(),
                "application/x-www-form-urlencoded".into(),
            )),
            Some(ExampleBody::Raw { content_type, .. }) => {
                headers.push(("Content-Type".into(), content_type.clone()))
            }
            None => {}
        }

        Self {
            method: op.method.to_uppercase(),
            url,
            headers,
            body,
        }
    }

    /// Render as a shell-ready `curl` command.
    pub fn to_curl(&self) -> String {
        let mut parts = vec![format!("curl -X {} {}", self.method, shell_quote(&self.url))];
        for (name, value) in &self.headers {
            parts.push(format!("  -H {}", shell_quote(&format!("{}: {}", name, value))));
        }
        match &self.body {
            Some(ExampleBody::Json(v)) => {
                parts.push(format!("  -d {}", shell_quote(&v.to_string())));
            }
            Some(ExampleBody::Form(fields)) => {
                let encoded: Vec<String> = fields
                    .iter()
                    .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
                    .collect();
                parts.push(format!("  -d {}", shell_quote(&encoded.join("&"))));
            }
            Some(ExampleBody::Raw { text, .. }) => {
                parts.push(format!("  --data-binary {}", shell_quote(text)));
            }
            None => {}
        }
        parts.join(" \\\n")
    }
}

fn param_value(param: &ParameterRecord) -> Value {
    match &param.schema {
        Some(s) => example_value(&s.schema, Direction::Request),
        None => json!(param.name),
    }
}

fn request_body(rb: &RequestBodyRecord) -> ExampleBody {
    let value = rb
        .schema
        .as_ref()
        .map(|s| example_value(&s.schema, Direction::Request))
        .unwrap_or_else(|| json!({}));
    match rb.content_type.as_deref() {
        None => ExampleBody::Json(value),
        Some(ct) if ct.contains("json") => ExampleBody::Json(value),
        Some("application/x-www-form-urlencoded") | Some("multipart/form-data") => {
            let fields = match &value {
                Value::Object(map) => map
                    .iter()
                    .map(|(k, v)| (k.clone(), scalar_text(v)))
                    .collect(),
                _ => Vec::new(),
            };
            ExampleBody::Form(fields)
        }
        Some(ct) => ExampleBody::Raw {
            content_type: ct.to_string(),
            text: match value {
                Value::String(s) => s,
                other => other.to_string(),
            },
        },
    }
}

/// Single-quote for POSIX shells.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SchemaRef;

    fn op(path: &str, method: &str) -> OperationRecord {
        OperationRecord {
            method: method.into(),
            path: path.into(),
            operation_id: None,
            tags: vec![],
            summary: None,
            description: None,
            base_urls: vec![],
            deprecated: false,
        }
    }

    fn param(name: &str, location: ParamLocation, required: bool, schema: Value) -> ParameterRecord {
        ParameterRecord {
            name: name.into(),
            location,
            required,
            description: None,
            schema: Some(SchemaRef::from_schema(&schema)),
        }
    }

    #[test]
    fn test_request_body_uses_required_writable_fields() {
        let schema = json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "id": {"type": "integer", "readOnly": true},
                "name": {"type": "string"},
                "tag": {"type": "string"}
            }
        });
        assert_eq!(example_value(&schema, Direction::Request), json!({"name": "string"}));
        let response = example_value(&schema, Direction::Response);
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["tag"], json!("string"));
    }

    #[test]
    fn test_explicit_values_win() {
        assert_eq!(example_value(&json!({"type": "string", "example": "Rex"}), Direction::Request), json!("Rex"));
        assert_eq!(example_value(&json!({"type": "string", "enum": ["available", "sold"]}), Direction::Request), json!("available"));
        assert_eq!(example_value(&json!({"type": "integer", "default": 20}), Direction::Request), json!(20));
        assert_eq!(example_value(&json!({"type": "string", "format": "date-time"}), Direction::Request), json!("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_cycle_stub_becomes_empty_object() {
        let schema = json!({
            "type": "object",
            "properties": {
                "children": {"type": "array", "items": {"x-askapi-cycle": "#/components/schemas/Node", "title": "Node"}}
            }
        });
        let value = example_value(&schema, Direction::Response);
        assert_eq!(value, json!({"children": [{}]}));
    }

    #[test]
    fn test_all_of_merges() {
        let schema = json!({"allOf": [
            {"type": "object", "properties": {"a": {"type": "boolean"}}},
            {"type": "object", "properties": {"b": {"type": "integer"}}}
        ]});
        assert_eq!(example_value(&schema, Direction::Response), json!({"a": true, "b": 1}));
    }

    #[test]
    fn test_curl_substitutes_path_and_query() {
        let mut get = op("/pets/{petId}", "get");
        get.base_urls = vec!["https://petstore.io/v1/".into()];
        let params = vec![
            param("petId", ParamLocation::Path, true, json!({"type": "integer"})),
            param("verbose", ParamLocation::Query, true, json!({"type": "boolean"})),
            param("page", ParamLocation::Query, false, json!({"type": "integer"})),
        ];
        let call = ExampleCall::for_operation(&get, &params, None);
        assert_eq!(call.url, "https://petstore.io/v1/pets/1?verbose=true");
        assert_eq!(call.to_curl(), "curl -X GET 'https://petstore.io/v1/pets/1?verbose=true'");
    }

    #[test]
    fn test_curl_with_json_body() {
        let post = op("/pets", "post");
        let body = RequestBodyRecord {
            content_type: Some("application/json".into()),
            content_types: vec!["application/json".into()],
            required: true,
            description: None,
            schema: Some(SchemaRef::from_schema(&json!({
                "type": "object",
                "required": ["name"],
                "properties": {"name": {"type": "string", "example": "O'Malley"}}
            }))),
        };
        let curl = ExampleCall::for_operation(&post, &[], Some(&body)).to_curl();
        assert!(curl.starts_with("curl -X POST 'https://api.example.com/pets'"));
        assert!(curl.contains("-H 'Content-Type: application/json'"));
        assert!(curl.contains(r#"-d '{"name":"O'\''Malley"}'"#));
    }

    #[test]
    fn test_form_data_params_become_form_body() {
        let post = op("/upload", "post");
        let params = vec![param("file", ParamLocation::FormData, true, json!({"type": "string"}))];
        let call = ExampleCall::for_operation(&post, &params, None);
        assert_eq!(call.body, Some(ExampleBody::Form(vec![("file".into(), "string".into())])));
        assert!(call.to_curl().contains("-d 'file=string'"));
    }
}
