//! DocumentBuilder: canonical spec → ordered records.
//!
//! Walks `paths` in sorted order and each path item in a fixed method order,
//! emitting one operation record followed by its parameter, request body and
//! response records, then one record per named schema. Both OpenAPI 3.x and
//! Swagger 2.0 layouts are understood.
//!
//! # Identifiers
//!
//! | Record | ID |
//! |--------|----|
//! | operation | `operation:<operationId>` |
//! | operation without a unique `operationId` | `operation:<sha256("METHOD path")[..16]>` |
//! | parameter | `<op-id>/param/<in>/<name>` |
//! | request body | `<op-id>/request-body` |
//! | response | `<op-id>/response/<status>` |
//! | schema | `schema:<name>` |
//!
//! IDs depend only on the identity-defining fields, never on traversal
//! order, so reordering keys in the source document leaves the ID set
//! unchanged.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use crate::example::{example_value, Direction, ExampleCall};
use crate::fingerprint::sha256_hex;
use crate::model::{
    property_summaries, type_label, OperationRecord, ParamLocation, ParameterRecord, Record,
    RecordBody, RecordMeta, RequestBodyRecord, ResponseRecord, SchemaRecord, SchemaRef,
};

/// Path item keys that are HTTP operations, in emission order.
pub const HTTP_METHODS: [&str; 8] = [
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

const OPERATION_KEYS: &[&str] = &[
    "operationId",
    "tags",
    "summary",
    "description",
    "parameters",
    "requestBody",
    "responses",
    "deprecated",
    "consumes",
    "produces",
    "servers",
];
const PARAMETER_KEYS: &[&str] = &[
    "name",
    "in",
    "required",
    "description",
    "schema",
    "type",
    "format",
    "items",
    "enum",
    "default",
];
const BODY_KEYS: &[&str] = &["content", "required", "description"];
const RESPONSE_KEYS: &[&str] = &["content", "description", "schema", "headers"];

/// Decompose a canonical spec into records.
pub fn build_records(spec: &Value) -> Vec<Record> {
    let global_urls = base_urls(spec);
    let global_consumes = string_list(spec.get("consumes"));
    let global_produces = string_list(spec.get("produces"));

    let mut operations: Vec<(&str, &str, &Map<String, Value>, &Map<String, Value>)> = Vec::new();
    if let Some(paths) = spec.get("paths").and_then(Value::as_object) {
        let mut keys: Vec<&String> = paths.keys().collect();
        keys.sort();
        for path in keys {
            let Some(item) = paths[path.as_str()].as_object() else {
                continue;
            };
            for method in HTTP_METHODS {
                if let Some(op) = item.get(method).and_then(Value::as_object) {
                    operations.push((path.as_str(), method, item, op));
                }
            }
        }
    }

    let mut id_counts: HashMap<&str, usize> = HashMap::new();
    for (_, _, _, op) in &operations {
        if let Some(id) = op.get("operationId").and_then(Value::as_str) {
            *id_counts.entry(id).or_default() += 1;
        }
    }

    let mut records = Vec::new();
    for (path, method, item, op) in operations {
        let operation_id = op
            .get("operationId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty());
        let op_record_id = match operation_id {
            Some(id) if id_counts.get(id) == Some(&1) => format!("operation:{}", id),
            _ => hashed_operation_id(method, path),
        };

        let urls = op
            .get("servers")
            .or_else(|| item.get("servers"))
            .map(server_urls)
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| global_urls.clone());
        let consumes = non_empty_or(string_list(op.get("consumes")), &global_consumes);
        let produces = non_empty_or(string_list(op.get("produces")), &global_produces);

        let operation = OperationRecord {
            method: method.to_uppercase(),
            path: path.to_string(),
            operation_id: operation_id.map(str::to_string),
            tags: string_list(op.get("tags")),
            summary: text_field(op, "summary"),
            description: text_field(op, "description"),
            base_urls: urls,
            deprecated: op.get("deprecated").and_then(Value::as_bool).unwrap_or(false),
        };
        let base_meta = RecordMeta {
            method: Some(operation.method.clone()),
            path: Some(operation.path.clone()),
            operation_id: operation.operation_id.clone(),
            tags: operation.tags.clone(),
            ..Default::default()
        };

        let (params, body_param) = merged_parameters(item, op);
        let request_body = match op.get("requestBody").and_then(Value::as_object) {
            Some(rb) => Some((openapi_request_body(rb), extensions(rb, BODY_KEYS))),
            None => body_param.map(|p| {
                (swagger_request_body(&p, &consumes), extensions(&p, PARAMETER_KEYS))
            }),
        };

        let call = ExampleCall::for_operation(
            &operation,
            &params.iter().map(|(p, _)| p.clone()).collect::<Vec<_>>(),
            request_body.as_ref().map(|(rb, _)| rb),
        );
        let curl = call.to_curl();

        records.push(Record {
            id: op_record_id.clone(),
            parent: None,
            meta: base_meta.clone(),
            body: RecordBody::Operation(operation),
            example: Some(curl.clone()),
            extensions: extensions(op, OPERATION_KEYS),
        });

        for (param, ext) in params {
            records.push(Record {
                id: format!("{}/param/{}/{}", op_record_id, param.location, param.name),
                parent: Some(op_record_id.clone()),
                meta: RecordMeta {
                    param_in: Some(param.location),
                    schema_name: param.schema.as_ref().and_then(|s| s.name.clone()),
                    ..base_meta.clone()
                },
                body: RecordBody::Parameter(param),
                example: Some(curl.clone()),
                extensions: ext,
            });
        }

        if let Some((body, ext)) = request_body {
            records.push(Record {
                id: format!("{}/request-body", op_record_id),
                parent: Some(op_record_id.clone()),
                meta: RecordMeta {
                    schema_name: body.schema.as_ref().and_then(|s| s.name.clone()),
                    ..base_meta.clone()
                },
                body: RecordBody::RequestBody(body),
                example: Some(curl.clone()),
                extensions: ext,
            });
        }

        if let Some(responses) = op.get("responses").and_then(Value::as_object) {
            let mut statuses: Vec<&String> = responses.keys().collect();
            statuses.sort();
            for status in statuses {
                let Some(resp) = responses[status.as_str()].as_object() else {
                    continue;
                };
                let response = response_record(status, resp, &produces);
                let example = match &response.schema {
                    Some(schema) => format!(
                        "{}\n\n# {} response\n{}",
                        curl,
                        status,
                        serde_json::to_string_pretty(&example_value(&schema.schema, Direction::Response))
                            .unwrap_or_default()
                    ),
                    None => curl.clone(),
                };
                records.push(Record {
                    id: format!("{}/response/{}", op_record_id, status),
                    parent: Some(op_record_id.clone()),
                    meta: RecordMeta {
                        status_code: Some(status.clone()),
                        schema_name: response.schema.as_ref().and_then(|s| s.name.clone()),
                        ..base_meta.clone()
                    },
                    body: RecordBody::Response(response),
                    example: Some(example),
                    extensions: extensions(resp, RESPONSE_KEYS),
                });
            }
        }
    }

    let schemas = spec
        .get("components")
        .and_then(|c| c.get("schemas"))
        .or_else(|| spec.get("definitions"))
        .and_then(Value::as_object);
    if let Some(schemas) = schemas {
        let mut names: Vec<&String> = schemas.keys().collect();
        names.sort();
        for name in names {
            let schema = &schemas[name.as_str()];
            let example = serde_json::to_string_pretty(&example_value(schema, Direction::Response))
                .unwrap_or_default();
            let obj = schema.as_object();
            records.push(Record {
                id: format!("schema:{}", name),
                parent: None,
                meta: RecordMeta {
                    schema_name: Some(name.clone()),
                    ..Default::default()
                },
                body: RecordBody::Schema(SchemaRecord {
                    name: name.clone(),
                    title: obj.and_then(|o| text_field(o, "title")),
                    type_shape: type_label(schema),
                    description: obj.and_then(|o| text_field(o, "description")),
                    properties: property_summaries(schema),
                    schema: schema.clone(),
                }),
                example: Some(example),
                extensions: obj.map(vendor_extensions).unwrap_or_default(),
            });
        }
    }

    records
}

/// Fallback ID for operations without a unique `operationId`.
pub fn hashed_operation_id(method: &str, path: &str) -> String {
    let digest = sha256_hex(&format!("{} {}", method.to_uppercase(), path));
    format!("operation:{}", &digest[..16])
}

/// Collection-safe slug of `info.title`.
///
/// Whitespace becomes `_`, other non-alphanumerics are dropped, and an
/// empty result falls back to `api`.
pub fn api_slug(spec: &Value) -> String {
    let title = spec
        .get("info")
        .and_then(|i| i.get("title"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let mut slug = String::new();
    for ch in title.trim().chars() {
        if ch.is_whitespace() {
            if !slug.ends_with('_') {
                slug.push('_');
            }
        } else if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            slug.push(ch.to_ascii_lowercase());
        }
    }
    let slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        "api".to_string()
    } else {
        slug
    }
}

/// Server URLs declared at the document level.
pub fn base_urls(spec: &Value) -> Vec<String> {
    if let Some(servers) = spec.get("servers") {
        return server_urls(servers);
    }
    match spec.get("host").and_then(Value::as_str) {
        Some(host) => {
            let base_path = spec.get("basePath").and_then(Value::as_str).unwrap_or("");
            let schemes = string_list(spec.get("schemes"));
            let scheme = if schemes.iter().any(|s| s == "https") || schemes.is_empty() {
                "https"
            } else {
                schemes[0].as_str()
            };
            vec![format!("{}://{}{}", scheme, host, base_path)]
        }
        None => Vec::new(),
    }
}

fn server_urls(servers: &Value) -> Vec<String> {
    let Some(list) = servers.as_array() else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|server| {
            let mut url = server.get("url")?.as_str()?.to_string();
            if let Some(vars) = server.get("variables").and_then(Value::as_object) {
                for (name, var) in vars {
                    if let Some(default) = var.get("default").and_then(Value::as_str) {
                        url = url.replace(&format!("{{{}}}", name), default);
                    }
                }
            }
            Some(url)
        })
        .filter(|url| !url.is_empty())
        .collect()
}

/// Path-level parameters overridden by operation-level ones on `(in, name)`.
///
/// Returns the parameter records and, for Swagger 2, the `in: body`
/// parameter that describes the request body.
fn merged_parameters(
    item: &Map<String, Value>,
    op: &Map<String, Value>,
) -> (Vec<(ParameterRecord, BTreeMap<String, Value>)>, Option<Map<String, Value>>) {
    let mut merged: Vec<(String, String, &Map<String, Value>)> = Vec::new();
    let levels = [item.get("parameters"), op.get("parameters")];
    for list in levels.into_iter().flatten().filter_map(Value::as_array) {
        for raw in list.iter().filter_map(Value::as_object) {
            let name = raw.get("name").and_then(Value::as_str).unwrap_or("").to_string();
            let location = raw.get("in").and_then(Value::as_str).unwrap_or("").to_string();
            merged.retain(|(n, l, _)| !(n == &name && l == &location));
            merged.push((name, location, raw));
        }
    }

    let mut params = Vec::new();
    let mut body = None;
    for (name, location, raw) in merged {
        if location == "body" {
            body = Some(raw.clone());
            continue;
        }
        let Some(location) = ParamLocation::parse(&location) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let schema = match raw.get("schema") {
            Some(schema) => Some(SchemaRef::from_schema(schema)),
            None => inline_parameter_schema(raw).map(|s| SchemaRef::from_schema(&s)),
        };
        let required = raw.get("required").and_then(Value::as_bool).unwrap_or(false)
            || location == ParamLocation::Path;
        params.push((
            ParameterRecord {
                name,
                location,
                required,
                description: text_field(raw, "description"),
                schema,
            },
            extensions(raw, PARAMETER_KEYS),
        ));
    }
    (params, body)
}

/// Swagger 2 non-body parameters carry their schema keys inline.
fn inline_parameter_schema(raw: &Map<String, Value>) -> Option<Value> {
    let mut schema = Map::new();
    for key in ["type", "format", "items", "enum", "default", "minimum", "maximum"] {
        if let Some(v) = raw.get(key) {
            schema.insert(key.to_string(), v.clone());
        }
    }
    if schema.is_empty() {
        None
    } else {
        Some(Value::Object(schema))
    }
}

fn openapi_request_body(rb: &Map<String, Value>) -> RequestBodyRecord {
    let content = rb.get("content").and_then(Value::as_object);
    let content_types = content
        .map(|c| {
            let mut types: Vec<String> = c.keys().cloned().collect();
            types.sort();
            types
        })
        .unwrap_or_default();
    let content_type = preferred_media_type(&content_types);
    let schema = content_type
        .as_ref()
        .and_then(|ct| content?.get(ct)?.get("schema"))
        .map(SchemaRef::from_schema);
    RequestBodyRecord {
        content_type,
        content_types,
        required: rb.get("required").and_then(Value::as_bool).unwrap_or(false),
        description: text_field(rb, "description"),
        schema,
    }
}

fn swagger_request_body(param: &Map<String, Value>, consumes: &[String]) -> RequestBodyRecord {
    RequestBodyRecord {
        content_type: preferred_media_type(consumes).or_else(|| Some("application/json".into())),
        content_types: consumes.to_vec(),
        required: param.get("required").and_then(Value::as_bool).unwrap_or(false),
        description: text_field(param, "description"),
        schema: param.get("schema").map(SchemaRef::from_schema),
    }
}

fn response_record(status: &str, resp: &Map<String, Value>, produces: &[String]) -> ResponseRecord {
    let (content_type, schema) = match resp.get("content").and_then(Value::as_object) {
        Some(content) => {
            let mut types: Vec<String> = content.keys().cloned().collect();
            types.sort();
            let ct = preferred_media_type(&types);
            let schema = ct
                .as_ref()
                .and_then(|ct| content.get(ct)?.get("schema"))
                .map(SchemaRef::from_schema);
            (ct, schema)
        }
        None => {
            let schema = resp.get("schema").map(SchemaRef::from_schema);
            let ct = schema.as_ref().and_then(|_| preferred_media_type(produces));
            (ct, schema)
        }
    };
    ResponseRecord {
        status: status.to_string(),
        content_type,
        description: text_field(resp, "description"),
        schema,
    }
}

/// JSON-ish media type if offered, else the first one.
fn preferred_media_type(types: &[String]) -> Option<String> {
    types
        .iter()
        .find(|t| t.contains("json"))
        .or_else(|| types.first())
        .cloned()
}

fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn non_empty_or(list: Vec<String>, fallback: &[String]) -> Vec<String> {
    if list.is_empty() {
        fallback.to_vec()
    } else {
        list
    }
}

/// Keys the model does not capture, minus resolver markers.
fn extensions(obj: &Map<String, Value>, known: &[&str]) -> BTreeMap<String, Value> {
    obj.iter()
        .filter(|(k, _)| !known.contains(&k.as_str()) && !k.starts_with("x-askapi-"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Vendor `x-*` keys of a schema; the schema JSON itself is kept whole.
fn vendor_extensions(obj: &Map<String, Value>) -> BTreeMap<String, Value> {
    obj.iter()
        .filter(|(k, _)| k.starts_with("x-") && !k.starts_with("x-askapi-"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordKind;
    use serde_json::json;

    fn petstore() -> Value {
        json!({
            "openapi": "3.0.3",
            "info": {"title": "Pet Store API", "version": "1.0"},
            "servers": [{"url": "https://petstore.example.com/v1"}],
            "paths": {
                "/pets/{id}": {
                    "parameters": [
                        {"name": "id", "in": "path", "required": true, "schema": {"type": "integer"}}
                    ],
                    "get": {
                        "operationId": "getPet",
                        "tags": ["pets"],
                        "summary": "Fetch a single pet",
                        "x-rate-limit": 100,
                        "parameters": [
                            {"name": "fields", "in": "query", "schema": {"type": "string"}}
                        ],
                        "responses": {
                            "200": {
                                "description": "The pet",
                                "content": {"application/json": {"schema": {
                                    "type": "object",
                                    "x-askapi-ref": "#/components/schemas/Pet",
                                    "properties": {"name": {"type": "string"}}
                                }}}
                            },
                            "404": {"description": "Not found"}
                        }
                    },
                    "delete": {
                        "responses": {"204": {"description": "Deleted"}}
                    }
                },
                "/pets": {
                    "post": {
                        "operationId": "createPet",
                        "requestBody": {
                            "required": true,
                            "content": {"application/json": {"schema": {
                                "type": "object",
                                "required": ["name"],
                                "properties": {"name": {"type": "string"}}
                            }}}
                        },
                        "responses": {"201": {"description": "Created"}}
                    }
                }
            },
            "components": {"schemas": {
                "Pet": {"type": "object", "properties": {"name": {"type": "string"}}, "x-internal": true}
            }}
        })
    }

    fn ids(records: &[Record]) -> Vec<String> {
        records.iter().map(|r| r.id.clone()).collect()
    }

    #[test]
    fn test_operation_id_from_operation_id() {
        let records = build_records(&petstore());
        let op = records.iter().find(|r| r.meta.operation_id.as_deref() == Some("getPet")).unwrap();
        assert_eq!(op.id, "operation:getPet");
        assert_eq!(op.kind(), RecordKind::Operation);
        assert_eq!(op.extensions.get("x-rate-limit"), Some(&json!(100)));
    }

    #[test]
    fn test_missing_operation_id_is_hashed() {
        let records = build_records(&petstore());
        let expected = hashed_operation_id("delete", "/pets/{id}");
        assert!(records.iter().any(|r| r.id == expected));
        assert_eq!(expected.len(), "operation:".len() + 16);
        assert!(ids(&records).contains(&format!("{}/response/204", expected)));
    }

    #[test]
    fn test_duplicate_operation_ids_fall_back_to_hash() {
        let spec = json!({
            "openapi": "3.0.0",
            "paths": {
                "/a": {"get": {"operationId": "dup", "responses": {}}},
                "/b": {"get": {"operationId": "dup", "responses": {}}}
            }
        });
        let records = build_records(&spec);
        let ids = ids(&records);
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&"operation:dup".to_string()));
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_children_reference_parent() {
        let records = build_records(&petstore());
        let ids = ids(&records);
        assert!(ids.contains(&"operation:getPet/param/path/id".to_string()));
        assert!(ids.contains(&"operation:getPet/param/query/fields".to_string()));
        assert!(ids.contains(&"operation:getPet/response/200".to_string()));
        assert!(ids.contains(&"operation:getPet/response/404".to_string()));
        assert!(ids.contains(&"operation:createPet/request-body".to_string()));
        assert!(ids.contains(&"schema:Pet".to_string()));

        let resp = records.iter().find(|r| r.id == "operation:getPet/response/200").unwrap();
        assert_eq!(resp.parent.as_deref(), Some("operation:getPet"));
        assert_eq!(resp.meta.status_code.as_deref(), Some("200"));
        assert_eq!(resp.meta.schema_name.as_deref(), Some("Pet"));
        assert_eq!(resp.meta.method.as_deref(), Some("GET"));
    }

    #[test]
    fn test_path_level_param_overridden_by_operation() {
        let spec = json!({
            "openapi": "3.0.0",
            "paths": {"/x/{id}": {
                "parameters": [{"name": "id", "in": "path", "description": "path level", "schema": {"type": "string"}}],
                "get": {
                    "operationId": "getX",
                    "parameters": [{"name": "id", "in": "path", "required": true, "description": "op level", "schema": {"type": "integer"}}],
                    "responses": {}
                }
            }}
        });
        let records = build_records(&spec);
        let params: Vec<&Record> = records.iter().filter(|r| r.kind() == RecordKind::Parameter).collect();
        assert_eq!(params.len(), 1);
        match &params[0].body {
            RecordBody::Parameter(p) => assert_eq!(p.description.as_deref(), Some("op level")),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_example_substitutes_path_params() {
        let records = build_records(&petstore());
        let op = records.iter().find(|r| r.id == "operation:getPet").unwrap();
        let example = op.example.as_deref().unwrap();
        assert!(example.starts_with("curl -X GET 'https://petstore.example.com/v1/pets/1'"));

        let create = records.iter().find(|r| r.id == "operation:createPet").unwrap();
        assert!(create.example.as_deref().unwrap().contains(r#"-d '{"name":"string"}'"#));
    }

    #[test]
    fn test_ids_independent_of_key_order() {
        let original = petstore();
        let text = serde_json::to_string(&original).unwrap();
        // Rebuild through a reversed-key copy.
        fn reverse(v: &Value) -> Value {
            match v {
                Value::Object(m) => {
                    let mut out = Map::new();
                    for (k, v) in m.iter().rev() {
                        out.insert(k.clone(), reverse(v));
                    }
                    Value::Object(out)
                }
                Value::Array(a) => Value::Array(a.iter().map(reverse).collect()),
                other => other.clone(),
            }
        }
        let reparsed: Value = serde_json::from_str(&text).unwrap();
        let mut a = ids(&build_records(&reparsed));
        let mut b = ids(&build_records(&reverse(&original)));
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_swagger2_layout() {
        let spec = json!({
            "swagger": "2.0",
            "info": {"title": "Legacy"},
            "host": "legacy.example.com",
            "basePath": "/api",
            "schemes": ["http"],
            "consumes": ["application/json"],
            "paths": {"/users": {"post": {
                "operationId": "createUser",
                "parameters": [
                    {"name": "user", "in": "body", "required": true, "schema": {"type": "object", "properties": {"email": {"type": "string", "format": "email"}}}},
                    {"name": "X-Trace", "in": "header", "required": true, "type": "string"}
                ],
                "responses": {"200": {"description": "ok", "schema": {"type": "object"}}}
            }}},
            "definitions": {"User": {"type": "object"}}
        });
        let records = build_records(&spec);
        let ids = ids(&records);
        assert!(ids.contains(&"operation:createUser/request-body".to_string()));
        assert!(ids.contains(&"operation:createUser/param/header/X-Trace".to_string()));
        assert!(!ids.iter().any(|id| id.contains("/param/body/")));
        assert!(ids.contains(&"schema:User".to_string()));

        let op = records.iter().find(|r| r.id == "operation:createUser").unwrap();
        let curl = op.example.as_deref().unwrap();
        assert!(curl.starts_with("curl -X POST 'http://legacy.example.com/api/users'"));
        assert!(curl.contains("-H 'X-Trace: string'"));
        assert!(curl.contains(r#""email":"user@example.com""#));
    }

    #[test]
    fn test_schema_records_keep_vendor_extensions() {
        let records = build_records(&petstore());
        let pet = records.iter().find(|r| r.id == "schema:Pet").unwrap();
        assert_eq!(pet.extensions.get("x-internal"), Some(&json!(true)));
        match &pet.body {
            RecordBody::Schema(s) => assert_eq!(s.type_shape, "object"),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_api_slug() {
        assert_eq!(api_slug(&petstore()), "pet_store_api");
        assert_eq!(api_slug(&json!({"info": {"title": "  ¡Hola!  "}})), "hola");
        assert_eq!(api_slug(&json!({})), "api");
    }
}
