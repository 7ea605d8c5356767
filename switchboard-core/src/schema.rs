//! Schema validation and default values.
//!
//! Replicant schemas are JSON Schema documents. The supported keywords are
//! the ones replicant schemas are written with in practice:
//!
//! | group    | keywords                                                           |
//! |----------|--------------------------------------------------------------------|
//! | any      | `type` `enum` `const` `$ref` (local) `allOf` `anyOf` `oneOf` `not` |
//! | number   | `minimum` `maximum` `exclusiveMinimum` `exclusiveMaximum` `multipleOf` |
//! | string   | `minLength` `maxLength` `pattern`                                  |
//! | array    | `items` `additionalItems` `minItems` `maxItems` `uniqueItems`      |
//! | object   | `properties` `required` `additionalProperties` `minProperties` `maxProperties` |
//!
//! Unknown keywords are ignored. A schema is compiled once (structure checked,
//! patterns built, digest computed) and then reused for every validation.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::pointer;
use crate::tree::type_name;

/// Nesting limit for `$ref` chains, so a self-referencing schema cannot
/// recurse forever on a cyclic reference.
const MAX_REF_DEPTH: usize = 64;

/// A schema could not be loaded or compiled.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("failed to read schema {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("schema {} is not valid JSON: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid schema at {location:?}: {reason}")]
    Invalid { location: String, reason: String },
}

/// One failed keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Pointer into the validated value.
    pub instance_path: String,
    pub keyword: &'static str,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.instance_path, self.message)
    }
}

/// A value failed validation. Carries every violation found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("value failed schema validation: {}", summarize(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Human-readable list of violations.
    pub fn summary(&self) -> String {
        summarize(&self.violations)
    }
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(Violation::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A compiled schema.
#[derive(Debug, Clone)]
pub struct Schema {
    document: Value,
    digest: String,
    patterns: HashMap<String, Regex>,
}

impl Schema {
    /// Compile a schema document.
    pub fn new(document: Value) -> Result<Self, SchemaError> {
        let mut patterns = HashMap::new();
        check(&document, &document, pointer::ROOT, &mut patterns)?;
        let digest = digest(&document);
        Ok(Self {
            document,
            digest,
            patterns,
        })
    }

    /// Load and compile a schema file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document = serde_json::from_str(&text).map_err(|source| SchemaError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(document)
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Content digest of the schema document.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Validate, failing with every violation found.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        let violations = self.violations(value);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { violations })
        }
    }

    pub fn is_valid(&self, value: &Value) -> bool {
        self.violations(value).is_empty()
    }

    /// Validate without failing.
    pub fn violations(&self, value: &Value) -> Vec<Violation> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.walk(&self.document, value, &mut path, 0, &mut out);
        out
    }

    /// Materialize the schema's declared defaults.
    pub fn default_value(&self) -> Option<Value> {
        self.default_of(&self.document, 0)
    }

    fn resolve<'a>(&'a self, reference: &str) -> Option<&'a Value> {
        let fragment = reference.strip_prefix('#')?;
        let segments = pointer::decode(fragment).ok()?;
        segments.iter().try_fold(&self.document, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    fn default_of(&self, schema: &Value, depth: usize) -> Option<Value> {
        let obj = schema.as_object()?;
        if let Some(target) = obj.get("$ref").and_then(Value::as_str) {
            if depth >= MAX_REF_DEPTH {
                return None;
            }
            return self.resolve(target).and_then(|s| self.default_of(s, depth + 1));
        }
        if let Some(default) = obj.get("default") {
            return Some(default.clone());
        }
        if let Some(Value::Array(parts)) = obj.get("allOf") {
            let mut merged: Option<Value> = None;
            for part in parts {
                let Some(value) = self.default_of(part, depth + 1) else {
                    continue;
                };
                match &mut merged {
                    Some(Value::Object(acc)) => {
                        if let Value::Object(more) = value {
                            acc.extend(more);
                        }
                    }
                    Some(_) => {}
                    None => merged = Some(value),
                }
            }
            return merged;
        }

        let declared = declared_types(obj);
        if declared.contains(&"object") || (declared.is_empty() && obj.contains_key("properties")) {
            let mut out = Map::new();
            if let Some(Value::Object(props)) = obj.get("properties") {
                for (key, prop) in props {
                    if let Some(value) = self.default_of(prop, depth + 1) {
                        out.insert(key.clone(), value);
                    }
                }
            }
            return Some(Value::Object(out));
        }
        if declared.contains(&"array") {
            let min = obj.get("minItems").and_then(Value::as_u64).unwrap_or(0) as usize;
            let item = obj.get("items").and_then(|items| self.default_of(items, depth + 1));
            return Some(match item {
                Some(item) if min > 0 => Value::Array(vec![item; min]),
                _ => Value::Array(Vec::new()),
            });
        }
        None
    }

    fn walk(&self, schema: &Value, value: &Value, path: &mut Vec<String>, depth: usize, out: &mut Vec<Violation>) {
        let obj = match schema {
            Value::Bool(true) => return,
            Value::Bool(false) => {
                out.push(violation(path, "false", "is not allowed here".to_string()));
                return;
            }
            Value::Object(obj) => obj,
            _ => return,
        };

        if let Some(target) = obj.get("$ref").and_then(Value::as_str) {
            match self.resolve(target) {
                Some(resolved) if depth < MAX_REF_DEPTH => self.walk(resolved, value, path, depth + 1, out),
                Some(_) => out.push(violation(path, "$ref", format!("{target} nests too deeply"))),
                None => out.push(violation(path, "$ref", format!("{target} does not resolve"))),
            }
            return;
        }

        let declared = declared_types(obj);
        if !declared.is_empty() && !declared.iter().any(|t| matches_type(t, value)) {
            out.push(violation(
                path,
                "type",
                format!("should be {} but is {}", declared.join(" or "), type_name(value)),
            ));
            return;
        }

        if let Some(Value::Array(allowed)) = obj.get("enum") {
            if !allowed.contains(value) {
                out.push(violation(path, "enum", "should be one of the allowed values".to_string()));
            }
        }
        if let Some(expected) = obj.get("const") {
            if expected != value {
                out.push(violation(path, "const", format!("should equal {expected}")));
            }
        }

        match value {
            Value::Number(n) => check_number(obj, n.as_f64().unwrap_or(0.0), path, out),
            Value::String(s) => self.check_string(obj, s, path, out),
            Value::Array(items) => self.check_array(obj, items, path, depth, out),
            Value::Object(map) => self.check_object(obj, map, path, depth, out),
            _ => {}
        }

        if let Some(Value::Array(parts)) = obj.get("allOf") {
            for part in parts {
                self.walk(part, value, path, depth + 1, out);
            }
        }
        if let Some(Value::Array(parts)) = obj.get("anyOf") {
            if !parts.iter().any(|p| self.passes(p, value, path, depth)) {
                out.push(violation(path, "anyOf", "should match at least one alternative".to_string()));
            }
        }
        if let Some(Value::Array(parts)) = obj.get("oneOf") {
            let matched = parts.iter().filter(|p| self.passes(p, value, path, depth)).count();
            if matched != 1 {
                out.push(violation(
                    path,
                    "oneOf",
                    format!("should match exactly one alternative but matches {matched}"),
                ));
            }
        }
        if let Some(negated) = obj.get("not") {
            if self.passes(negated, value, path, depth) {
                out.push(violation(path, "not", "should not match the negated schema".to_string()));
            }
        }
    }

    fn passes(&self, schema: &Value, value: &Value, path: &mut Vec<String>, depth: usize) -> bool {
        let mut scratch = Vec::new();
        self.walk(schema, value, path, depth + 1, &mut scratch);
        scratch.is_empty()
    }

    fn check_string(&self, obj: &Map<String, Value>, s: &str, path: &[String], out: &mut Vec<Violation>) {
        let len = s.chars().count() as u64;
        if let Some(min) = obj.get("minLength").and_then(Value::as_u64) {
            if len < min {
                out.push(violation(path, "minLength", format!("should have at least {min} characters")));
            }
        }
        if let Some(max) = obj.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                out.push(violation(path, "maxLength", format!("should have at most {max} characters")));
            }
        }
        if let Some(pattern) = obj.get("pattern").and_then(Value::as_str) {
            if let Some(re) = self.patterns.get(pattern) {
                if !re.is_match(s) {
                    out.push(violation(path, "pattern", format!("should match pattern {pattern:?}")));
                }
            }
        }
    }

    fn check_array(
        &self,
        obj: &Map<String, Value>,
        items: &[Value],
        path: &mut Vec<String>,
        depth: usize,
        out: &mut Vec<Violation>,
    ) {
        if let Some(min) = obj.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min {
                out.push(violation(path, "minItems", format!("should have at least {min} items")));
            }
        }
        if let Some(max) = obj.get("maxItems").and_then(Value::as_u64) {
            if items.len() as u64 > max {
                out.push(violation(path, "maxItems", format!("should have at most {max} items")));
            }
        }
        if obj.get("uniqueItems").and_then(Value::as_bool) == Some(true) {
            let duplicate = items
                .iter()
                .enumerate()
                .any(|(i, a)| items[i + 1..].iter().any(|b| a == b));
            if duplicate {
                out.push(violation(path, "uniqueItems", "should not contain duplicates".to_string()));
            }
        }

        match obj.get("items") {
            Some(Value::Array(tuple)) => {
                for (index, item) in items.iter().enumerate() {
                    let schema = tuple.get(index).or_else(|| obj.get("additionalItems"));
                    if let Some(schema) = schema {
                        path.push(index.to_string());
                        self.walk(schema, item, path, depth + 1, out);
                        path.pop();
                    }
                }
            }
            Some(schema) => {
                for (index, item) in items.iter().enumerate() {
                    path.push(index.to_string());
                    self.walk(schema, item, path, depth + 1, out);
                    path.pop();
                }
            }
            None => {}
        }
    }

    fn check_object(
        &self,
        obj: &Map<String, Value>,
        map: &Map<String, Value>,
        path: &mut Vec<String>,
        depth: usize,
        out: &mut Vec<Violation>,
    ) {
        if let Some(Value::Array(required)) = obj.get("required") {
            for key in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(key) {
                    out.push(violation(path, "required", format!("should have required property {key:?}")));
                }
            }
        }
        if let Some(min) = obj.get("minProperties").and_then(Value::as_u64) {
            if (map.len() as u64) < min {
                out.push(violation(path, "minProperties", format!("should have at least {min} properties")));
            }
        }
        if let Some(max) = obj.get("maxProperties").and_then(Value::as_u64) {
            if map.len() as u64 > max {
                out.push(violation(path, "maxProperties", format!("should have at most {max} properties")));
            }
        }

        let properties = obj.get("properties").and_then(Value::as_object);
        let additional = obj.get("additionalProperties");
        for (key, member) in map {
            let schema = match properties.and_then(|p| p.get(key)) {
                Some(schema) => schema,
                None => match additional {
                    Some(Value::Bool(false)) => {
                        path.push(key.clone());
                        out.push(violation(path, "additionalProperties", "is not an allowed property".to_string()));
                        path.pop();
                        continue;
                    }
                    Some(schema) => schema,
                    None => continue,
                },
            };
            path.push(key.clone());
            self.walk(schema, member, path, depth + 1, out);
            path.pop();
        }
    }
}

/// Content digest of a schema document: SHA-256 over its canonical JSON
/// serialization, hex encoded.
pub fn digest(document: &Value) -> String {
    let canonical = serde_json::to_vec(document).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

fn violation(path: &[String], keyword: &'static str, message: String) -> Violation {
    Violation {
        instance_path: pointer::encode(path),
        keyword,
        message,
    }
}

fn declared_types(obj: &Map<String, Value>) -> Vec<&str> {
    match obj.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn matches_type(declared: &str, value: &Value) -> bool {
    match declared {
        "integer" => value
            .as_f64()
            .is_some_and(|n| n.fract() == 0.0 && n.is_finite()),
        "number" => value.is_number(),
        other => other == type_name(value),
    }
}

fn check_number(obj: &Map<String, Value>, n: f64, path: &[String], out: &mut Vec<Violation>) {
    let bound = |key: &str| obj.get(key).and_then(Value::as_f64);
    if let Some(min) = bound("minimum") {
        if n < min {
            out.push(violation(path, "minimum", format!("should be >= {min}")));
        }
    }
    if let Some(max) = bound("maximum") {
        if n > max {
            out.push(violation(path, "maximum", format!("should be <= {max}")));
        }
    }
    if let Some(min) = bound("exclusiveMinimum") {
        if n <= min {
            out.push(violation(path, "exclusiveMinimum", format!("should be > {min}")));
        }
    }
    if let Some(max) = bound("exclusiveMaximum") {
        if n >= max {
            out.push(violation(path, "exclusiveMaximum", format!("should be < {max}")));
        }
    }
    if let Some(step) = bound("multipleOf") {
        if step > 0.0 && ((n / step) - (n / step).round()).abs() > 1e-9 {
            out.push(violation(path, "multipleOf", format!("should be a multiple of {step}")));
        }
    }
}

const KNOWN_TYPES: [&str; 7] = ["null", "boolean", "number", "integer", "string", "array", "object"];

/// Structural check of a schema document. Also compiles every `pattern`.
fn check(
    schema: &Value,
    root: &Value,
    location: &str,
    patterns: &mut HashMap<String, Regex>,
) -> Result<(), SchemaError> {
    let invalid = |reason: String| SchemaError::Invalid {
        location: location.to_string(),
        reason,
    };
    let obj = match schema {
        Value::Bool(_) => return Ok(()),
        Value::Object(obj) => obj,
        other => return Err(invalid(format!("expected an object or boolean, found {}", type_name(other)))),
    };

    for t in declared_types(obj) {
        if !KNOWN_TYPES.contains(&t) {
            return Err(invalid(format!("unknown type {t:?}")));
        }
    }
    if let Some(t) = obj.get("type") {
        if !t.is_string() && !t.is_array() {
            return Err(invalid("\"type\" must be a string or an array".to_string()));
        }
    }
    if let Some(reference) = obj.get("$ref") {
        match reference.as_str() {
            Some(r) if r.starts_with('#') => {}
            _ => return Err(invalid("only local \"$ref\" values (\"#/...\") are supported".to_string())),
        }
    }
    if let Some(required) = obj.get("required") {
        let ok = required.as_array().is_some_and(|r| r.iter().all(Value::is_string));
        if !ok {
            return Err(invalid("\"required\" must be an array of strings".to_string()));
        }
    }
    if let Some(pattern) = obj.get("pattern") {
        let pattern = pattern
            .as_str()
            .ok_or_else(|| invalid("\"pattern\" must be a string".to_string()))?;
        if !patterns.contains_key(pattern) {
            let re = Regex::new(pattern).map_err(|e| invalid(format!("bad pattern: {e}")))?;
            patterns.insert(pattern.to_string(), re);
        }
    }

    for keyword in ["properties", "definitions", "$defs"] {
        match obj.get(keyword) {
            None => {}
            Some(Value::Object(children)) => {
                for (key, child) in children {
                    let at = pointer::join(&pointer::join(location, keyword), key);
                    check(child, root, &at, patterns)?;
                }
            }
            Some(_) => return Err(invalid(format!("{keyword:?} must be an object"))),
        }
    }
    for keyword in ["allOf", "anyOf", "oneOf"] {
        match obj.get(keyword) {
            None => {}
            Some(Value::Array(children)) => {
                for (index, child) in children.iter().enumerate() {
                    let at = pointer::join(&pointer::join(location, keyword), &index.to_string());
                    check(child, root, &at, patterns)?;
                }
            }
            Some(_) => return Err(invalid(format!("{keyword:?} must be an array"))),
        }
    }
    match obj.get("items") {
        Some(Value::Array(children)) => {
            for (index, child) in children.iter().enumerate() {
                let at = pointer::join(&pointer::join(location, "items"), &index.to_string());
                check(child, root, &at, patterns)?;
            }
        }
        Some(child) => check(child, root, &pointer::join(location, "items"), patterns)?,
        None => {}
    }
    for keyword in ["additionalProperties", "additionalItems", "not"] {
        if let Some(child) = obj.get(keyword) {
            check(child, root, &pointer::join(location, keyword), patterns)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scores() -> Schema {
        Schema::new(json!({
            "type": "object",
            "properties": {
                "home": {"type": "number", "default": 0},
                "away": {"type": "number", "default": 0},
                "team": {"type": "string", "minLength": 1}
            },
            "required": ["home"],
            "additionalProperties": false
        }))
        .unwrap()
    }

    #[test]
    fn test_default_from_properties() {
        assert_eq!(scores().default_value(), Some(json!({"home": 0, "away": 0})));
    }

    #[test]
    fn test_explicit_default_wins() {
        let schema = Schema::new(json!({"type": "object", "default": {"x": 1}, "properties": {"y": {"default": 2}}})).unwrap();
        assert_eq!(schema.default_value(), Some(json!({"x": 1})));
    }

    #[test]
    fn test_no_default_for_scalar_without_one() {
        let schema = Schema::new(json!({"type": "string"})).unwrap();
        assert_eq!(schema.default_value(), None);
    }

    #[test]
    fn test_array_default_uses_min_items() {
        let schema = Schema::new(json!({"type": "array", "minItems": 2, "items": {"type": "number", "default": 5}})).unwrap();
        assert_eq!(schema.default_value(), Some(json!([5, 5])));
    }

    #[test]
    fn test_valid_value() {
        scores().validate(&json!({"home": 1, "away": 2, "team": "red"})).unwrap();
    }

    #[test]
    fn test_collects_every_violation() {
        let err = scores()
            .validate(&json!({"away": "two", "team": "", "extra": true}))
            .unwrap_err();
        let keywords: Vec<_> = err.violations.iter().map(|v| v.keyword).collect();
        assert!(keywords.contains(&"required"));
        assert!(keywords.contains(&"type"));
        assert!(keywords.contains(&"minLength"));
        assert!(keywords.contains(&"additionalProperties"));

        let away = err.violations.iter().find(|v| v.keyword == "type").unwrap();
        assert_eq!(away.instance_path, "/away");
        assert!(err.to_string().contains("/away should be number but is string"));
    }

    #[test]
    fn test_integer_and_bounds() {
        let schema = Schema::new(json!({"type": "integer", "minimum": 0, "exclusiveMaximum": 10})).unwrap();
        assert!(schema.is_valid(&json!(0)));
        assert!(schema.is_valid(&json!(9)));
        assert!(!schema.is_valid(&json!(10)));
        assert!(!schema.is_valid(&json!(-1)));
        assert!(!schema.is_valid(&json!(1.5)));
    }

    #[test]
    fn test_items_and_unique() {
        let schema = Schema::new(json!({
            "type": "array",
            "items": {"type": "string", "pattern": "^[a-z]+$"},
            "uniqueItems": true,
            "maxItems": 3
        }))
        .unwrap();
        assert!(schema.is_valid(&json!(["a", "b"])));
        assert!(!schema.is_valid(&json!(["a", "a"])));
        assert!(!schema.is_valid(&json!(["A"])));
        assert!(!schema.is_valid(&json!(["a", "b", "c", "d"])));
        let err = schema.validate(&json!(["ok", 3])).unwrap_err();
        assert_eq!(err.violations[0].instance_path, "/1");
    }

    #[test]
    fn test_combinators_and_refs() {
        let schema = Schema::new(json!({
            "definitions": {"name": {"type": "string", "minLength": 2}},
            "type": "object",
            "properties": {
                "who": {"$ref": "#/definitions/name"},
                "id": {"oneOf": [{"type": "string"}, {"type": "integer"}]},
                "mode": {"enum": ["live", "replay"]},
                "flag": {"not": {"const": false}}
            }
        }))
        .unwrap();
        assert!(schema.is_valid(&json!({"who": "al", "id": 3, "mode": "live", "flag": true})));
        assert!(!schema.is_valid(&json!({"who": "a"})));
        assert!(!schema.is_valid(&json!({"id": 1.5})));
        assert!(!schema.is_valid(&json!({"mode": "paused"})));
        assert!(!schema.is_valid(&json!({"flag": false})));
    }

    #[test]
    fn test_cyclic_ref_terminates() {
        let schema = Schema::new(json!({"$ref": "#"})).unwrap();
        assert!(!schema.is_valid(&json!(1)));
        assert_eq!(schema.default_value(), None);
    }

    #[test]
    fn test_rejects_malformed_schema() {
        assert!(matches!(
            Schema::new(json!({"type": "thing"})),
            Err(SchemaError::Invalid { .. })
        ));
        assert!(Schema::new(json!({"properties": {"a": 5}})).is_err());
        assert!(Schema::new(json!({"pattern": "("})).is_err());
        assert!(Schema::new(json!({"$ref": "other.json#/x"})).is_err());
    }

    #[test]
    fn test_digest_is_stable_and_content_sensitive() {
        let a = Schema::new(json!({"type": "object", "properties": {"a": {}, "b": {}}})).unwrap();
        let b = Schema::new(serde_json::from_str(r#"{"properties":{"b":{},"a":{}},"type":"object"}"#).unwrap()).unwrap();
        let c = Schema::new(json!({"type": "array"})).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scores.json");
        std::fs::write(&path, r#"{"type":"object","properties":{"home":{"default":0}}}"#).unwrap();
        let schema = Schema::load(&path).unwrap();
        assert_eq!(schema.default_value(), Some(json!({"home": 0})));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Schema::load(&path), Err(SchemaError::Parse { .. })));
        assert!(matches!(
            Schema::load(dir.path().join("missing.json")),
            Err(SchemaError::Io { .. })
        ));
    }
}
