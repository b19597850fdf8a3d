//! `$ref` resolution over a set of already-loaded documents.
//!
//! The loader fetches the root document and every external document it
//! (transitively) references into a [`DocumentSet`]; [`resolve`] then walks
//! the root depth-first and substitutes each reference node with the
//! resolved target subtree. Nothing here performs I/O.
//!
//! # Markers
//!
//! The canonical tree never contains a `$ref` key. Instead:
//!
//! | Key | Meaning |
//! |-----|---------|
//! | [`REF_ANNOTATION`] | object was inlined from this reference |
//! | [`CYCLE_MARKER`] | reference closes a cycle; replaced by a named stub |
//! | [`UNRESOLVED_MARKER`] | target missing or unreachable; subtree omitted |
//!
//! Before walking, the reference graph is split into strongly connected
//! components. A schema referenced from many places (a DAG) is inlined
//! everywhere. Schemas on a cycle are expanded one level: once any member
//! of a cyclic group is being expanded (or its own definition is being
//! walked), every reference back into the group becomes a named stub. Each
//! target is expanded once and reused, so the canonical tree stays
//! proportional to the input.

use std::collections::{BTreeSet, HashMap, HashSet};

use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};
use url::Url;

use crate::error::{RefFailure, RefResolutionError};

/// Key added to every object that was inlined from a `$ref`.
pub const REF_ANNOTATION: &str = "x-askapi-ref";
/// Key of the stub substituted for a cyclic reference.
pub const CYCLE_MARKER: &str = "x-askapi-cycle";
/// Key of the stub substituted for a reference that could not be resolved.
pub const UNRESOLVED_MARKER: &str = "x-askapi-unresolved";

/// Loaded documents keyed by identity (absolute URL without fragment).
#[derive(Debug, Clone)]
pub struct DocumentSet {
    root_id: String,
    docs: HashMap<String, Value>,
    unavailable: HashMap<String, RefFailure>,
}

impl DocumentSet {
    pub fn new(root_id: impl Into<String>, root: Value) -> Self {
        let root_id = root_id.into();
        let mut docs = HashMap::new();
        docs.insert(root_id.clone(), root);
        Self {
            root_id,
            docs,
            unavailable: HashMap::new(),
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn root(&self) -> &Value {
        // The root is inserted by the constructor and never removed.
        &self.docs[&self.root_id]
    }

    pub fn insert(&mut self, id: impl Into<String>, doc: Value) {
        let id = id.into();
        self.unavailable.remove(&id);
        self.docs.insert(id, doc);
    }

    /// Record that an external document could not be loaded.
    pub fn mark_unavailable(&mut self, id: impl Into<String>, reason: RefFailure) {
        self.unavailable.insert(id.into(), reason);
    }

    /// True if the document was either loaded or found to be unavailable.
    pub fn is_known(&self, id: &str) -> bool {
        self.docs.contains_key(id) || self.unavailable.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.docs.get(id)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn lookup(&self, id: &str) -> Result<&Value, RefFailure> {
        if let Some(doc) = self.docs.get(id) {
            return Ok(doc);
        }
        Err(self
            .unavailable
            .get(id)
            .cloned()
            .unwrap_or_else(|| RefFailure::Fetch(format!("document {} was not loaded", id))))
    }
}

/// Output of [`resolve`]: the dereferenced tree plus every absorbed failure.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub canonical: Value,
    pub warnings: Vec<RefResolutionError>,
}

/// Split a reference into `(document id, JSON pointer)` relative to `base`.
///
/// `#/a/b` stays in `base`; `other.yaml#/a` and `https://host/x.json` are
/// joined against `base` with URL semantics.
pub fn split_reference(base: &str, reference: &str) -> Result<(String, String), RefFailure> {
    let (doc_part, fragment) = match reference.split_once('#') {
        Some((doc, frag)) => (doc, frag),
        None => (reference, ""),
    };

    let doc_id = if doc_part.is_empty() {
        base.to_string()
    } else {
        let base_url = Url::parse(base)
            .map_err(|e| RefFailure::Fetch(format!("invalid base {}: {}", base, e)))?;
        let mut joined = base_url
            .join(doc_part)
            .map_err(|e| RefFailure::Fetch(format!("invalid reference {}: {}", reference, e)))?;
        joined.set_fragment(None);
        joined.to_string()
    };

    Ok((doc_id, percent_decode(fragment)))
}

/// Collect the identities of every external document referenced from `doc`.
pub fn external_documents(doc: &Value, base: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_external(doc, base, &mut out);
    out
}

fn collect_external(value: &Value, base: &str, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get("$ref") {
                if let Ok((doc_id, _)) = split_reference(base, reference) {
                    if doc_id != base {
                        out.insert(doc_id);
                    }
                }
            }
            for v in map.values() {
                collect_external(v, base, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_external(v, base, out);
            }
        }
        _ => {}
    }
}

/// Fully dereference the root document of `docs`.
///
/// Always terminates: cyclic references get a [`CYCLE_MARKER`] stub and
/// unresolvable ones an [`UNRESOLVED_MARKER`] stub, each reported once in
/// [`Resolution::warnings`].
pub fn resolve(docs: &DocumentSet) -> Resolution {
    let mut resolver = Resolver {
        docs,
        cyclic: cyclic_groups(docs),
        stack: Vec::new(),
        memo: HashMap::new(),
        warnings: Vec::new(),
        reported: HashSet::new(),
    };
    let canonical = resolver.resolve_value(docs.root(), docs.root_id(), "");
    Resolution {
        canonical,
        warnings: resolver.warnings,
    }
}

type Target = (String, String);

struct Resolver<'a> {
    docs: &'a DocumentSet,
    /// Targets that sit on a reference cycle, mapped to their group.
    cyclic: HashMap<Target, usize>,
    /// Cyclic targets currently being expanded.
    stack: Vec<Target>,
    memo: HashMap<Target, Value>,
    warnings: Vec<RefResolutionError>,
    reported: HashSet<(String, String)>,
}

impl Resolver<'_> {
    /// `pointer` is the location of `value` inside document `base`.
    fn resolve_value(&mut self, value: &Value, base: &str, pointer: &str) -> Value {
        let entered = self.enter_definition(base, pointer);
        let out = match value {
            Value::Object(map) => match map.get("$ref") {
                Some(Value::String(reference)) => self.resolve_ref(reference, map, base, pointer),
                _ => Value::Object(
                    map.iter()
                        .map(|(k, v)| {
                            let child = child_pointer(pointer, k);
                            (k.clone(), self.resolve_value(v, base, &child))
                        })
                        .collect(),
                ),
            },
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| self.resolve_value(v, base, &format!("{}/{}", pointer, i)))
                    .collect(),
            ),
            other => other.clone(),
        };
        if entered {
            self.stack.pop();
        }
        out
    }

    /// Walking the definition of a cyclic target counts as expanding it, so
    /// references back into its group below the definition become stubs.
    fn enter_definition(&mut self, base: &str, pointer: &str) -> bool {
        if self.cyclic.is_empty() {
            return false;
        }
        let key = (base.to_string(), pointer.to_string());
        if !self.cyclic.contains_key(&key) || self.stack.contains(&key) {
            return false;
        }
        self.stack.push(key);
        true
    }

    fn in_expansion(&self, group: usize) -> bool {
        self.stack
            .iter()
            .any(|t| self.cyclic.get(t) == Some(&group))
    }

    fn resolve_ref(
        &mut self,
        reference: &str,
        siblings: &Map<String, Value>,
        base: &str,
        pointer: &str,
    ) -> Value {
        let target = match split_reference(base, reference) {
            Ok(t) => t,
            Err(reason) => return self.unresolved(reference, base, reason),
        };

        if let Some(&group) = self.cyclic.get(&target) {
            if self.in_expansion(group) {
                self.report(reference, base, RefFailure::Cycle);
                return cycle_stub(reference, &target.1);
            }
        }

        // An expansion never depends on where it was reached from: inside
        // it, references to its own group are stubbed and no other group
        // it reaches can be on the stack.
        let mut resolved = match self.memo.get(&target) {
            Some(v) => v.clone(),
            None => {
                let doc = match self.docs.lookup(&target.0) {
                    Ok(doc) => doc,
                    Err(reason) => return self.unresolved(reference, base, reason),
                };
                let node = match doc.pointer(&target.1) {
                    Some(node) => node,
                    None => return self.unresolved(reference, base, RefFailure::NotFound),
                };
                let value = self.resolve_value(node, &target.0, &target.1);
                self.memo.insert(target.clone(), value.clone());
                value
            }
        };

        if let Value::Object(map) = &mut resolved {
            for (k, v) in siblings {
                if k != "$ref" {
                    let v = self.resolve_value(v, base, &child_pointer(pointer, k));
                    map.insert(k.clone(), v);
                }
            }
            map.insert(
                REF_ANNOTATION.to_string(),
                Value::String(reference.to_string()),
            );
        }
        resolved
    }

    fn unresolved(&mut self, reference: &str, base: &str, reason: RefFailure) -> Value {
        self.report(reference, base, reason);
        let mut stub = Map::new();
        stub.insert(
            UNRESOLVED_MARKER.to_string(),
            Value::String(reference.to_string()),
        );
        Value::Object(stub)
    }

    fn report(&mut self, reference: &str, base: &str, reason: RefFailure) {
        if self
            .reported
            .insert((base.to_string(), reference.to_string()))
        {
            self.warnings.push(RefResolutionError {
                reference: reference.to_string(),
                base: base.to_string(),
                reason,
            });
        }
    }
}

fn child_pointer(pointer: &str, key: &str) -> String {
    format!("{}/{}", pointer, key.replace('~', "~0").replace('/', "~1"))
}

// ============ Reference graph ============

/// Targets that lie on a reference cycle, grouped by strongly connected
/// component. A target's edges are the references anywhere in its subtree.
fn cyclic_groups(docs: &DocumentSet) -> HashMap<Target, usize> {
    let mut ids: HashMap<Target, usize> = HashMap::new();
    let mut nodes: Vec<Target> = Vec::new();
    let mut edges: Vec<Vec<usize>> = Vec::new();

    let mut intern = |t: Target, nodes: &mut Vec<Target>, edges: &mut Vec<Vec<usize>>| -> usize {
        *ids.entry(t.clone()).or_insert_with(|| {
            nodes.push(t);
            edges.push(Vec::new());
            nodes.len() - 1
        })
    };

    let mut pending: Vec<usize> = Vec::new();
    let mut refs = Vec::new();
    collect_targets(docs.root(), docs.root_id(), &mut refs);
    for t in refs.drain(..) {
        let before = nodes.len();
        let id = intern(t, &mut nodes, &mut edges);
        if id == before {
            pending.push(id);
        }
    }

    while let Some(id) = pending.pop() {
        let (doc_id, pointer) = nodes[id].clone();
        let Some(node) = docs.get(&doc_id).and_then(|d| d.pointer(&pointer)) else {
            continue;
        };
        collect_targets(node, &doc_id, &mut refs);
        for t in refs.drain(..) {
            let before = nodes.len();
            let to = intern(t, &mut nodes, &mut edges);
            if to == before {
                pending.push(to);
            }
            edges[id].push(to);
        }
    }

    let mut out = HashMap::new();
    for (group, members) in strongly_connected(&edges).into_iter().enumerate() {
        let looped = members.len() > 1 || edges[members[0]].contains(&members[0]);
        if looped {
            for m in members {
                out.insert(nodes[m].clone(), group);
            }
        }
    }
    out
}

fn collect_targets(value: &Value, base: &str, out: &mut Vec<Target>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get("$ref") {
                if let Ok(target) = split_reference(base, reference) {
                    out.push(target);
                }
            }
            for v in map.values() {
                collect_targets(v, base, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_targets(v, base, out);
            }
        }
        _ => {}
    }
}

/// Tarjan's algorithm, iterative so deep schema chains cannot overflow.
fn strongly_connected(edges: &[Vec<usize>]) -> Vec<Vec<usize>> {
    const UNVISITED: usize = usize::MAX;
    let n = edges.len();
    let mut index = vec![UNVISITED; n];
    let mut low = vec![0; n];
    let mut on_stack = vec![false; n];
    let mut stack = Vec::new();
    let mut groups = Vec::new();
    let mut next = 0;

    for start in 0..n {
        if index[start] != UNVISITED {
            continue;
        }
        // (node, next edge to look at)
        let mut work = vec![(start, 0usize)];
        index[start] = next;
        low[start] = next;
        next += 1;
        stack.push(start);
        on_stack[start] = true;

        while let Some(&(v, edge)) = work.last() {
            if let Some(&w) = edges[v].get(edge) {
                if let Some(top) = work.last_mut() {
                    top.1 += 1;
                }
                if index[w] == UNVISITED {
                    index[w] = next;
                    low[w] = next;
                    next += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    work.push((w, 0));
                } else if on_stack[w] {
                    low[v] = low[v].min(index[w]);
                }
                continue;
            }

            work.pop();
            if let Some(&(parent, _)) = work.last() {
                low[parent] = low[parent].min(low[v]);
            }
            if low[v] == index[v] {
                let mut group = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack[w] = false;
                    group.push(w);
                    if w == v {
                        break;
                    }
                }
                groups.push(group);
            }
        }
    }
    groups
}

fn cycle_stub(reference: &str, pointer: &str) -> Value {
    let mut stub = Map::new();
    stub.insert(CYCLE_MARKER.to_string(), Value::String(reference.to_string()));
    stub.insert("title".to_string(), Value::String(ref_name(reference, pointer)));
    Value::Object(stub)
}

/// Human name for a reference: the last pointer segment, or the file stem.
pub fn reference_name(reference: &str) -> String {
    let pointer = reference.split_once('#').map(|(_, f)| f).unwrap_or("");
    ref_name(reference, &percent_decode(pointer))
}

fn ref_name(reference: &str, pointer: &str) -> String {
    if let Some(last) = pointer.rsplit('/').find(|s| !s.is_empty()) {
        return last.replace("~1", "/").replace("~0", "~");
    }
    let doc = reference.split('#').next().unwrap_or(reference);
    let file = doc.rsplit('/').next().unwrap_or(doc);
    file.split('.').next().unwrap_or(file).to_string()
}

fn percent_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ROOT: &str = "memory:///spec.json";

    fn resolve_root(root: Value) -> Resolution {
        resolve(&DocumentSet::new(ROOT, root))
    }

    #[test]
    fn test_local_ref_inlined_and_annotated() {
        let res = resolve_root(json!({
            "components": {"schemas": {"Pet": {"type": "object", "properties": {"name": {"type": "string"}}}}},
            "paths": {"/pets": {"get": {"responses": {"200": {"content": {"application/json": {
                "schema": {"$ref": "#/components/schemas/Pet"}
            }}}}}}}
        }));
        assert!(res.warnings.is_empty());
        let schema = res
            .canonical
            .pointer("/paths/~1pets/get/responses/200/content/application~1json/schema")
            .unwrap();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema[REF_ANNOTATION], "#/components/schemas/Pet");
        assert!(!res.canonical.to_string().contains("\"$ref\""));
    }

    #[test]
    fn test_self_referential_schema_terminates() {
        let res = resolve_root(json!({
            "components": {"schemas": {"Node": {
                "type": "object",
                "properties": {
                    "value": {"type": "string"},
                    "children": {"type": "array", "items": {"$ref": "#/components/schemas/Node"}}
                }
            }}},
            "paths": {"/tree": {"get": {"responses": {"200": {"content": {"application/json": {
                "schema": {"$ref": "#/components/schemas/Node"}
            }}}}}}}
        }));

        assert!(res.warnings.iter().all(|w| w.is_cycle()));
        assert!(!res.warnings.is_empty());

        let definition = res.canonical.pointer("/components/schemas/Node").unwrap();
        let stub = &definition["properties"]["children"]["items"];
        assert_eq!(stub[CYCLE_MARKER], "#/components/schemas/Node");
        assert_eq!(stub["title"], "Node");

        let used = res
            .canonical
            .pointer("/paths/~1tree/get/responses/200/content/application~1json/schema")
            .unwrap();
        assert_eq!(used[REF_ANNOTATION], "#/components/schemas/Node");
        assert_eq!(used["properties"]["value"]["type"], "string");
        assert_eq!(
            used["properties"]["children"]["items"][CYCLE_MARKER],
            "#/components/schemas/Node"
        );
    }

    #[test]
    fn test_mutual_recursion_terminates() {
        let res = resolve_root(json!({
            "components": {"schemas": {
                "A": {"type": "object", "properties": {"b": {"$ref": "#/components/schemas/B"}}},
                "B": {"type": "object", "properties": {"a": {"$ref": "#/components/schemas/A"}}}
            }},
            "x-use": {"$ref": "#/components/schemas/A"}
        }));
        let a = res.canonical.pointer("/components/schemas/A").unwrap();
        assert_eq!(a["properties"]["b"][CYCLE_MARKER], "#/components/schemas/B");

        let used = &res.canonical["x-use"];
        assert_eq!(used["type"], "object");
        assert_eq!(used["properties"]["b"][CYCLE_MARKER], "#/components/schemas/B");
    }

    #[test]
    fn test_dense_cycles_stay_proportional_to_input() {
        let n = 12;
        let mut schemas = serde_json::Map::new();
        let mut paths = serde_json::Map::new();
        for i in 0..n {
            let properties: serde_json::Map<String, Value> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (format!("s{}", j), json!({"$ref": format!("#/components/schemas/S{}", j)})))
                .collect();
            schemas.insert(format!("S{}", i), json!({"type": "object", "properties": properties}));
            paths.insert(
                format!("/s{}", i),
                json!({"get": {"responses": {"200": {"content": {"application/json": {
                    "schema": {"$ref": format!("#/components/schemas/S{}", i)}
                }}}}}}),
            );
        }
        let root = json!({"components": {"schemas": schemas}, "paths": paths});
        let input = root.to_string().len();

        let res = resolve_root(root);
        let output = res.canonical.to_string().len();
        assert!(
            output < input * 8,
            "canonical grew from {} to {} bytes",
            input,
            output
        );
        assert!(!res.canonical.to_string().contains("\"$ref\""));
        assert!(res.warnings.iter().all(|w| w.is_cycle()));
        assert_eq!(res.warnings.len(), n);
    }

    #[test]
    fn test_chain_into_cycle_keeps_outer_schemas_inlined() {
        let res = resolve_root(json!({
            "components": {"schemas": {
                "Page": {"type": "object", "properties": {"root": {"$ref": "#/components/schemas/Node"}}},
                "Node": {"type": "object", "properties": {"next": {"$ref": "#/components/schemas/Node"}}}
            }}
        }));
        let page = res.canonical.pointer("/components/schemas/Page").unwrap();
        let root = &page["properties"]["root"];
        assert_eq!(root[REF_ANNOTATION], "#/components/schemas/Node");
        assert_eq!(root["properties"]["next"][CYCLE_MARKER], "#/components/schemas/Node");
    }

    #[test]
    fn test_shared_schema_is_not_a_cycle() {
        let res = resolve_root(json!({
            "components": {"schemas": {
                "Id": {"type": "integer"},
                "Pair": {"type": "object", "properties": {
                    "left": {"$ref": "#/components/schemas/Id"},
                    "right": {"$ref": "#/components/schemas/Id"}
                }}
            }}
        }));
        assert!(res.warnings.is_empty());
        let pair = res.canonical.pointer("/components/schemas/Pair/properties").unwrap();
        assert_eq!(pair["left"]["type"], "integer");
        assert_eq!(pair["right"]["type"], "integer");
    }

    #[test]
    fn test_missing_local_target_is_warning() {
        let res = resolve_root(json!({"a": {"$ref": "#/nowhere"}}));
        assert_eq!(res.warnings.len(), 1);
        assert_eq!(res.warnings[0].reason, RefFailure::NotFound);
        assert_eq!(res.canonical["a"][UNRESOLVED_MARKER], "#/nowhere");
    }

    #[test]
    fn test_external_document_resolution() {
        let mut docs = DocumentSet::new(
            "file:///specs/api.yaml",
            json!({"schema": {"$ref": "models/pet.yaml#/Pet"}}),
        );
        docs.insert(
            "file:///specs/models/pet.yaml",
            json!({"Pet": {"type": "object", "properties": {"owner": {"$ref": "#/Owner"}}},
                   "Owner": {"type": "string"}}),
        );
        let res = resolve(&docs);
        assert!(res.warnings.is_empty(), "{:?}", res.warnings);
        assert_eq!(res.canonical["schema"]["properties"]["owner"]["type"], "string");
    }

    #[test]
    fn test_unavailable_external_document() {
        let mut docs = DocumentSet::new(ROOT, json!({"s": {"$ref": "https://example.com/x.json#/A"}}));
        docs.mark_unavailable("https://example.com/x.json", RefFailure::Status(404));
        let res = resolve(&docs);
        assert_eq!(res.warnings[0].reason, RefFailure::Status(404));
        assert!(res.canonical["s"].get(UNRESOLVED_MARKER).is_some());
    }

    #[test]
    fn test_external_documents_collected() {
        let doc = json!({
            "a": {"$ref": "#/local"},
            "b": {"$ref": "common.yaml#/X"},
            "c": [{"$ref": "../shared/types.json"}]
        });
        let ext = external_documents(&doc, "file:///specs/api/root.yaml");
        let ext: Vec<&str> = ext.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            ext,
            vec!["file:///specs/api/common.yaml", "file:///specs/shared/types.json"]
        );
    }

    #[test]
    fn test_sibling_keys_override() {
        let res = resolve_root(json!({
            "defs": {"Id": {"type": "string", "description": "generic"}},
            "use": {"$ref": "#/defs/Id", "description": "pet id"}
        }));
        assert_eq!(res.canonical["use"]["description"], "pet id");
        assert_eq!(res.canonical["use"]["type"], "string");
    }

    #[test]
    fn test_percent_encoded_pointer() {
        let res = resolve_root(json!({
            "paths": {"/pets/{id}": {"x": 1}},
            "alias": {"$ref": "#/paths/~1pets~1%7Bid%7D"}
        }));
        assert!(res.warnings.is_empty());
        assert_eq!(res.canonical["alias"]["x"], 1);
    }

    #[test]
    fn test_reference_name() {
        assert_eq!(reference_name("#/components/schemas/Pet"), "Pet");
        assert_eq!(reference_name("models/pet.yaml"), "pet");
        assert_eq!(reference_name("common.yaml#/Error"), "Error");
    }
}
