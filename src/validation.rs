//! Declarative input schemas for request bodies and query strings.
//!
//! A [`Schema`] pairs a list of [`FieldRule`]s with a target type. Checking
//! input runs in four steps:
//!
//! 1. Parse: JSON for bodies, form decoding for query strings. Unparsable
//!    input is a malformed Validation error with no field list.
//! 2. Structural checks: every rule is evaluated and every violation kept.
//! 3. Typed deserialization into the target type.
//! 4. `validator::Validate` rules on the typed value, merged in as further
//!    violations for fields not already reported.
//!
//! The caller gets either the typed value or one Validation error listing
//! everything wrong with the input.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};
use validator::Validate;

use crate::error::{ApiError, FieldViolation, InputLocation};

/// Field name used when a violation concerns the whole input.
pub const ROOT_FIELD: &str = "$";

/// JSON type a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    /// Interpret a raw query value as this type. Values that do not parse
    /// stay strings so the type check reports them.
    fn coerce(self, raw: String) -> Value {
        match self {
            FieldType::Integer => raw
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or(Value::String(raw)),
            FieldType::Number => raw
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::String(raw)),
            FieldType::Boolean => match raw.as_str() {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => Value::String(raw),
            },
            FieldType::String | FieldType::Array | FieldType::Object => Value::String(raw),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural constraints on one top-level field.
#[derive(Debug, Clone)]
pub struct FieldRule {
    name: String,
    field_type: FieldType,
    required: bool,
    min_length: Option<usize>,
    max_length: Option<usize>,
    min: Option<f64>,
    max: Option<f64>,
    allowed: Vec<Value>,
}

impl FieldRule {
    fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            min_length: None,
            max_length: None,
            min: None,
            max: None,
            allowed: Vec::new(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn array(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Array)
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Object)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Character count for strings, element count for arrays.
    pub fn length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// First violation of this rule, if any. `null` counts as missing.
    fn check(&self, value: Option<&Value>) -> Option<String> {
        let value = match value {
            None | Some(Value::Null) => {
                return self.required.then(|| "is required".to_string());
            }
            Some(value) => value,
        };

        if !self.field_type.matches(value) {
            return Some(format!("expected {}", self.field_type));
        }

        let length = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            _ => None,
        };
        if let Some(length) = length {
            if let Some(min) = self.min_length
                && length < min
            {
                return Some(format!("length must be at least {min}"));
            }
            if let Some(max) = self.max_length
                && length > max
            {
                return Some(format!("length must be at most {max}"));
            }
        }

        if let Some(number) = value.as_f64() {
            if let Some(min) = self.min
                && number < min
            {
                return Some(format!("must be at least {min}"));
            }
            if let Some(max) = self.max
                && number > max
            {
                return Some(format!("must be at most {max}"));
            }
        }

        if !self.allowed.is_empty() && !self.allowed.contains(value) {
            let allowed: Vec<String> = self.allowed.iter().map(Value::to_string).collect();
            return Some(format!("must be one of {}", allowed.join(", ")));
        }

        None
    }
}

/// Declared input shape plus the type it deserializes into.
pub struct Schema<T> {
    rules: Vec<FieldRule>,
    _target: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Schema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("rules", &self.rules).finish()
    }
}

impl<T> Clone for Schema<T> {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
            _target: PhantomData,
        }
    }
}

impl<T> Default for Schema<T> {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            _target: PhantomData,
        }
    }
}

impl<T> Schema<T>
where
    T: DeserializeOwned + Validate,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    fn rule(&self, name: &str) -> Option<&FieldRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Parse and check a JSON request body.
    pub fn validate_body(&self, raw: &[u8]) -> Result<T, ApiError> {
        let value = parse_body(raw)?;
        self.check(value, InputLocation::Body)
            .map_err(ApiError::validation)
    }

    /// Parse and check a URL query string. `None` is an empty query.
    pub fn validate_query(&self, raw: Option<&str>) -> Result<T, ApiError> {
        let value = self.parse_query(raw.unwrap_or_default())?;
        self.check(value, InputLocation::Query)
            .map_err(ApiError::validation)
    }

    /// Decode `a=1&b=x&b=y` into an object. Repeated keys become arrays;
    /// declared scalar fields are coerced to their rule's type.
    fn parse_query(&self, raw: &str) -> Result<Value, ApiError> {
        // First-seen key order is kept; the index makes repeats O(1).
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            // Invalid percent-encoded UTF-8 is decoded lossily
            if key.contains('\u{FFFD}') || value.contains('\u{FFFD}') {
                return Err(ApiError::malformed("Malformed query string"));
            }
            match index.get(key.as_ref()) {
                Some(&slot) => {
                    if let Some((_, values)) = grouped.get_mut(slot) {
                        values.push(value.into_owned());
                    }
                }
                None => {
                    index.insert(key.clone().into_owned(), grouped.len());
                    grouped.push((key.into_owned(), vec![value.into_owned()]));
                }
            }
        }

        let mut object = Map::new();
        for (key, values) in grouped {
            let field_type = self.rule(&key).map(FieldRule::field_type);
            let value = match (field_type, values.as_slice()) {
                (Some(FieldType::Array), _) => {
                    Value::Array(values.into_iter().map(Value::String).collect())
                }
                (Some(field_type), [single]) => field_type.coerce(single.clone()),
                (None, [single]) => Value::String(single.clone()),
                _ => Value::Array(values.into_iter().map(Value::String).collect()),
            };
            object.insert(key, value);
        }
        Ok(Value::Object(object))
    }

    /// Run structural rules, deserialization and `Validate` on a parsed value.
    pub fn check(&self, value: Value, location: InputLocation) -> Result<T, Vec<FieldViolation>> {
        let mut violations = Vec::new();

        if !self.rules.is_empty() {
            let Some(object) = value.as_object() else {
                return Err(vec![FieldViolation::new(
                    ROOT_FIELD,
                    location,
                    "expected object",
                )]);
            };
            for rule in &self.rules {
                if let Some(message) = rule.check(object.get(&rule.name)) {
                    violations.push(FieldViolation::new(&rule.name, location, message));
                }
            }
        }

        let parsed: Result<T, _> = serde_path_to_error::deserialize(value);
        match parsed {
            Ok(parsed) => {
                if let Err(errors) = parsed.validate() {
                    let reported: HashSet<String> =
                        violations.iter().map(|v| v.field.clone()).collect();
                    let mut extra: Vec<FieldViolation> = errors
                        .field_errors()
                        .into_iter()
                        .filter(|(field, _)| !reported.contains(&**field))
                        .filter_map(|(field, errs)| {
                            errs.first().map(|e| {
                                FieldViolation::new(field.into_owned(), location, describe(e))
                            })
                        })
                        .collect();
                    extra.sort_by(|a, b| a.field.cmp(&b.field));
                    violations.extend(extra);
                }
                if violations.is_empty() {
                    return Ok(parsed);
                }
            }
            Err(e) => {
                // Deserialization stops at the first bad field; report it
                // unless a rule already named that field.
                let violation = deserialize_violation(&e, location);
                if !violations.iter().any(|v| v.field == violation.field) {
                    violations.push(violation);
                }
            }
        }

        Err(violations)
    }
}

fn parse_body(raw: &[u8]) -> Result<Value, ApiError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::malformed("Malformed request body"));
    }
    serde_json::from_slice(raw).map_err(|_| ApiError::malformed("Malformed request body"))
}

fn describe(error: &validator::ValidationError) -> String {
    match &error.message {
        Some(message) => message.to_string(),
        None => format!("failed '{}' check", error.code),
    }
}

/// Map a serde error into a violation without echoing input values.
fn deserialize_violation(
    error: &serde_path_to_error::Error<serde_json::Error>,
    location: InputLocation,
) -> FieldViolation {
    let path = error.path().to_string();
    let at = |name: &str| {
        if path == "." {
            name.to_string()
        } else {
            format!("{path}.{name}")
        }
    };

    let text = error.inner().to_string();
    if let Some(rest) = text.strip_prefix("missing field `")
        && let Some((field, _)) = rest.split_once('`')
    {
        return FieldViolation::new(at(field), location, "is required");
    }
    if let Some(rest) = text.strip_prefix("unknown field `")
        && let Some((field, _)) = rest.split_once('`')
    {
        return FieldViolation::new(at(field), location, "is not allowed");
    }

    let field = if path == "." { ROOT_FIELD.to_string() } else { path.clone() };
    if text.starts_with("invalid type") {
        return FieldViolation::new(field, location, "has an invalid type");
    }
    if text.starts_with("invalid value") || text.starts_with("invalid length") {
        return FieldViolation::new(field, location, "has an invalid value");
    }
    FieldViolation::new(field, location, "does not match the expected shape")
}

/// Placeholder input type for a pipeline without a body or query schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Validate)]
pub struct NoInput {}

/// Parsed, typed request input.
#[derive(Debug)]
pub struct Validated<B, Q> {
    pub body: Option<B>,
    pub query: Option<Q>,
}

/// Check body and query against their schemas in one pass.
///
/// Violations from both locations are combined into a single error.
/// Malformed input short-circuits, since there are no fields to list.
pub fn validate<B, Q>(
    raw_body: Option<&[u8]>,
    raw_query: Option<&str>,
    body_schema: Option<&Schema<B>>,
    query_schema: Option<&Schema<Q>>,
) -> Result<Validated<B, Q>, ApiError>
where
    B: DeserializeOwned + Validate,
    Q: DeserializeOwned + Validate,
{
    let mut violations = Vec::new();

    let body = match body_schema {
        Some(schema) => {
            let value = parse_body(raw_body.unwrap_or_default())?;
            match schema.check(value, InputLocation::Body) {
                Ok(parsed) => Some(parsed),
                Err(found) => {
                    violations.extend(found);
                    None
                }
            }
        }
        None => None,
    };

    let query = match query_schema {
        Some(schema) => {
            let value = schema.parse_query(raw_query.unwrap_or_default())?;
            match schema.check(value, InputLocation::Query) {
                Ok(parsed) => Some(parsed),
                Err(found) => {
                    violations.extend(found);
                    None
                }
            }
        }
        None => None,
    };

    if violations.is_empty() {
        Ok(Validated { body, query })
    } else {
        Err(ApiError::validation(violations))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Validate)]
    struct CreateConsultation {
        title: String,
        #[validate(length(max = 500, message = "must be at most 500 characters"))]
        description: Option<String>,
        #[validate(email(message = "must be a valid email"))]
        contact: Option<String>,
        priority: Option<u8>,
    }

    #[derive(Debug, Deserialize, Validate)]
    struct ListResources {
        page: Option<u32>,
        published: Option<bool>,
        #[serde(default)]
        tag: Vec<String>,
    }

    fn consultation_schema() -> Schema<CreateConsultation> {
        Schema::new()
            .field(FieldRule::string("title").required().length(Some(3), Some(120)))
            .field(FieldRule::string("description"))
            .field(FieldRule::integer("priority").range(Some(1.0), Some(5.0)))
    }

    fn list_schema() -> Schema<ListResources> {
        Schema::new()
            .field(FieldRule::integer("page").range(Some(1.0), None))
            .field(FieldRule::boolean("published"))
            .field(FieldRule::array("tag"))
    }

    fn violations(err: ApiError) -> Vec<FieldViolation> {
        match err {
            ApiError::Validation { errors, .. } => errors,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_body() {
        let parsed = consultation_schema()
            .validate_body(br#"{"title":"Lease review","priority":2}"#)
            .unwrap();
        assert_eq!(parsed.title, "Lease review");
        assert_eq!(parsed.priority, Some(2));
    }

    #[test]
    fn test_missing_required_title() {
        let err = consultation_schema()
            .validate_body(br#"{"description":"no title"}"#)
            .unwrap_err();
        let found = violations(err);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field, "title");
        assert_eq!(found[0].message, "is required");
        assert_eq!(found[0].location, InputLocation::Body);
    }

    #[test]
    fn test_null_counts_as_missing() {
        let found = violations(
            consultation_schema()
                .validate_body(br#"{"title":null}"#)
                .unwrap_err(),
        );
        assert_eq!(found[0].field, "title");
    }

    #[test]
    fn test_every_violation_is_listed() {
        let err = consultation_schema()
            .validate_body(br#"{"title":"ab","description":7,"priority":9}"#)
            .unwrap_err();
        let found = violations(err);

        let fields: Vec<&str> = found.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, ["title", "description", "priority"]);
        assert_eq!(found[0].message, "length must be at least 3");
        assert_eq!(found[1].message, "expected string");
        assert_eq!(found[2].message, "must be at most 5");
    }

    #[test]
    fn test_validator_rules_are_merged() {
        let err = consultation_schema()
            .validate_body(br#"{"title":"Lease review","contact":"not-an-email"}"#)
            .unwrap_err();
        let found = violations(err);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field, "contact");
        assert_eq!(found[0].message, "must be a valid email");
    }

    #[test]
    fn test_structural_and_validator_violations_combine() {
        let err = consultation_schema()
            .validate_body(br#"{"title":"Lease review","priority":0,"contact":"nope"}"#)
            .unwrap_err();
        let fields: Vec<String> = violations(err).into_iter().map(|v| v.field).collect();
        assert_eq!(fields, ["priority", "contact"]);
    }

    #[test]
    fn test_unparsable_body_is_malformed() {
        let err = consultation_schema().validate_body(b"{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "Malformed request body");
        assert_eq!(err.details().unwrap()["reason"], "malformed");
    }

    #[test]
    fn test_empty_body_is_malformed() {
        let err = consultation_schema().validate_body(b"  ").unwrap_err();
        assert_eq!(err.details().unwrap()["reason"], "malformed");
    }

    #[test]
    fn test_non_object_body() {
        let found = violations(consultation_schema().validate_body(b"[1,2]").unwrap_err());
        assert_eq!(found[0].field, ROOT_FIELD);
    }

    #[test]
    fn test_deserialize_failure_without_rules_names_field() {
        let schema: Schema<CreateConsultation> = Schema::new();
        let found = violations(schema.validate_body(br#"{"priority":1}"#).unwrap_err());
        assert_eq!(found[0].field, "title");
        assert_eq!(found[0].message, "is required");
    }

    #[derive(Debug, Deserialize, Validate)]
    #[allow(dead_code)]
    struct Draft {
        title: String,
        count: u32,
    }

    #[test]
    fn test_fields_without_rules_are_still_reported() {
        let schema: Schema<Draft> = Schema::new().field(FieldRule::string("title").required());
        let found = violations(schema.validate_body(br#"{"count":"many"}"#).unwrap_err());

        let fields: Vec<&str> = found.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, ["title", "count"]);
        assert_eq!(found[0].message, "is required");
        assert_eq!(found[1].message, "has an invalid type");
    }

    #[test]
    fn test_field_with_rule_is_reported_once() {
        let schema: Schema<Draft> = Schema::new()
            .field(FieldRule::string("title").required())
            .field(FieldRule::integer("count"));
        let found = violations(schema.validate_body(br#"{"count":"many"}"#).unwrap_err());

        let fields: Vec<&str> = found.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, ["title", "count"]);
        assert_eq!(found[1].message, "expected integer");
    }

    #[test]
    fn test_out_of_range_number_names_its_field() {
        let found = violations(
            list_schema()
                .validate_query(Some("page=4294967296"))
                .unwrap_err(),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field, "page");
        assert_eq!(found[0].location, InputLocation::Query);
        assert_eq!(found[0].message, "has an invalid value");
    }

    #[test]
    fn test_nested_shape_error_names_its_path() {
        let schema: Schema<ListResources> = Schema::new();
        let found = violations(schema.validate_body(br#"{"tag":["ok",7]}"#).unwrap_err());
        assert_eq!(found[0].field, "tag[1]");
        assert_eq!(found[0].message, "has an invalid type");
    }

    #[test]
    fn test_query_with_many_keys_keeps_repeats_in_order() {
        let mut raw: String = (0..5_000).map(|i| format!("k{i}=v&")).collect();
        raw.push_str("tag=a&page=2&tag=b&k7=w&tag=c");

        let schema = list_schema();
        let value = schema.parse_query(&raw).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 5_002);
        assert_eq!(object["k7"], serde_json::json!(["v", "w"]));

        let parsed = schema.validate_query(Some(&raw)).unwrap();
        assert_eq!(parsed.tag, ["a", "b", "c"]);
        assert_eq!(parsed.page, Some(2));
    }

    #[test]
    fn test_query_coercion() {
        let parsed = list_schema()
            .validate_query(Some("page=2&published=true&tag=tax&tag=family"))
            .unwrap();
        assert_eq!(parsed.page, Some(2));
        assert_eq!(parsed.published, Some(true));
        assert_eq!(parsed.tag, ["tax", "family"]);
    }

    #[test]
    fn test_single_value_for_array_field() {
        let parsed = list_schema().validate_query(Some("tag=tax")).unwrap();
        assert_eq!(parsed.tag, ["tax"]);
    }

    #[test]
    fn test_empty_query() {
        let parsed = list_schema().validate_query(None).unwrap();
        assert!(parsed.page.is_none());
        assert!(parsed.tag.is_empty());
    }

    #[test]
    fn test_query_violations() {
        let err = list_schema()
            .validate_query(Some("page=zero&published=maybe"))
            .unwrap_err();
        let found = violations(err);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].field, "page");
        assert_eq!(found[0].message, "expected integer");
        assert_eq!(found[0].location, InputLocation::Query);
        assert_eq!(found[1].message, "expected boolean");
    }

    #[test]
    fn test_query_range() {
        let found = violations(list_schema().validate_query(Some("page=0")).unwrap_err());
        assert_eq!(found[0].message, "must be at least 1");
    }

    #[test]
    fn test_one_of() {
        let rule = FieldRule::string("status").one_of(["open", "closed"]);
        assert!(rule.check(Some(&Value::from("open"))).is_none());
        assert_eq!(
            rule.check(Some(&Value::from("pending"))).unwrap(),
            r#"must be one of "open", "closed""#
        );
    }

    #[test]
    fn test_body_and_query_violations_combined() {
        let body_schema = consultation_schema();
        let query_schema = list_schema();
        let err = validate(
            Some(br#"{"priority":3}"#.as_slice()),
            Some("page=abc"),
            Some(&body_schema),
            Some(&query_schema),
        )
        .unwrap_err();

        let found = violations(err);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].location, InputLocation::Body);
        assert_eq!(found[1].location, InputLocation::Query);
    }

    #[test]
    fn test_missing_body_with_schema_is_malformed() {
        let body_schema = consultation_schema();
        let err = validate::<CreateConsultation, NoInput>(None, None, Some(&body_schema), None)
            .unwrap_err();
        assert_eq!(err.details().unwrap()["reason"], "malformed");
    }

    #[test]
    fn test_no_schemas_is_a_no_op() {
        let validated =
            validate::<NoInput, NoInput>(Some(b"garbage".as_slice()), Some("x=1"), None, None)
                .unwrap();
        assert!(validated.body.is_none());
        assert!(validated.query.is_none());
    }
}
