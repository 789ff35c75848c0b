use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value, json};

use super::Error;

/// The type of a tool parameter, as declared by its JSON schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    /// A JSON string.
    String,
    /// A whole number.
    Integer,
    /// Any number.
    Number,
    /// `true` or `false`.
    Boolean,
    /// A JSON array.
    Array,
    /// A JSON object.
    Object,
}

impl ParameterType {
    fn from_schema_type(ty: &str) -> Option<Self> {
        let ty = match ty {
            "string" => ParameterType::String,
            "integer" => ParameterType::Integer,
            "number" => ParameterType::Number,
            "boolean" => ParameterType::Boolean,
            "array" => ParameterType::Array,
            "object" => ParameterType::Object,
            _ => return None,
        };
        Some(ty)
    }

    /// Returns the JSON schema name of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
        }
    }

    /// Converts `value` into this type, or returns `None` if it cannot be
    /// represented.
    ///
    /// Models often quote numbers or send `4.0` for an integer, so those
    /// are accepted.
    pub fn coerce(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (ParameterType::String, Value::String(_))
            | (ParameterType::Boolean, Value::Bool(_))
            | (ParameterType::Array, Value::Array(_))
            | (ParameterType::Object, Value::Object(_))
            | (ParameterType::Number, Value::Number(_)) => Some(value.clone()),
            (ParameterType::Integer, Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    return Some(value.clone());
                }
                let f = n.as_f64()?;
                // `i64::MAX as f64` rounds up to 2^63, which does not fit.
                let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
                (f.fract() == 0.0 && in_range).then(|| Value::from(f as i64))
            }
            (ParameterType::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().ok().map(Value::from)
            }
            (ParameterType::Number, Value::String(s)) => {
                let f = s.trim().parse::<f64>().ok()?;
                Number::from_f64(f).map(Value::Number)
            }
            (ParameterType::Boolean, Value::String(s)) => {
                match s.trim().to_ascii_lowercase().as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, typed parameter of a tool.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    /// Name of the parameter.
    pub name: String,
    /// Declared type.
    pub ty: ParameterType,
    /// Natural-language description, if any.
    pub description: Option<String>,
    /// Whether the parameter must be present.
    pub required: bool,
    schema: Value,
}

/// Why a JSON schema could not be read as a parameter list.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The root of the schema does not describe an object.
    #[error("the parameter schema must describe an object")]
    NotAnObject,
    /// A property has no type we know of.
    #[error("parameter `{0}` has no supported type")]
    UnsupportedType(String),
}

/// The ordered list of parameters a tool accepts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterSchema {
    parameters: Vec<Parameter>,
    definitions: Option<Value>,
}

impl ParameterSchema {
    /// Reads a JSON schema of an object into an ordered parameter list.
    ///
    /// Property order is kept as it appears in the schema.
    pub fn from_json_schema(schema: &Value) -> Result<Self, SchemaError> {
        let Value::Object(root) = schema else {
            return Err(SchemaError::NotAnObject);
        };
        if let Some(ty) = root.get("type") {
            if ty != "object" {
                return Err(SchemaError::NotAnObject);
            }
        }

        let required: Vec<&str> = root
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let definitions =
            root.get("$defs").or_else(|| root.get("definitions"));
        let mut parameters = vec![];
        if let Some(properties) = root.get("properties") {
            let Value::Object(properties) = properties else {
                return Err(SchemaError::NotAnObject);
            };
            for (name, property) in properties {
                let ty = property_type(property, definitions, 0)
                    .ok_or_else(|| SchemaError::UnsupportedType(name.clone()))?;
                let description = property
                    .get("description")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
                parameters.push(Parameter {
                    name: name.clone(),
                    ty,
                    description,
                    required: required.contains(&name.as_str()),
                    schema: property.clone(),
                });
            }
        }

        Ok(Self {
            parameters,
            definitions: definitions.cloned(),
        })
    }

    /// Returns the parameters in declaration order.
    #[inline]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Returns the schema advertised to the model.
    ///
    /// It only contains what the model needs: properties in declaration
    /// order, the required list, and shared definitions if any.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.schema.clone()))
            .collect();
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        let mut schema = json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        });
        if let Some(definitions) = &self.definitions {
            schema["$defs"] = definitions.clone();
        }
        schema
    }

    /// Validates `arguments` and returns them coerced to the declared types.
    ///
    /// `null` arguments are treated as an empty object, and a parameter
    /// given as `null` counts as absent.
    pub fn validate(&self, arguments: &Value) -> Result<Value, Error> {
        let empty = Map::new();
        let arguments = match arguments {
            Value::Object(arguments) => arguments,
            Value::Null => &empty,
            other => {
                return Err(Error::invalid_input().with_reason(format!(
                    "arguments must be an object, got {}",
                    json_type_name(other)
                )));
            }
        };

        if let Some(name) = arguments
            .keys()
            .find(|name| !self.parameters.iter().any(|p| &p.name == *name))
        {
            return Err(Error::invalid_input()
                .with_reason(format!("unexpected argument `{name}`")));
        }

        let mut coerced = Map::new();
        for parameter in &self.parameters {
            let value = match arguments.get(&parameter.name) {
                None | Some(Value::Null) => {
                    if parameter.required {
                        return Err(Error::invalid_input().with_reason(
                            format!(
                                "missing required argument `{}`",
                                parameter.name
                            ),
                        ));
                    }
                    continue;
                }
                Some(value) => value,
            };
            let Some(value) = parameter.ty.coerce(value) else {
                return Err(Error::invalid_input().with_reason(format!(
                    "argument `{}` must be {}, got {}",
                    parameter.name,
                    parameter.ty,
                    json_type_name(value)
                )));
            };
            coerced.insert(parameter.name.clone(), value);
        }
        Ok(Value::Object(coerced))
    }
}

/// Picks the first non-null type of a property. Optional fields generated
/// by schemars look like `{"type": ["integer", "null"]}`.
///
/// References are looked up in `definitions`. A reference that cannot be
/// resolved is taken to be an object.
fn property_type(
    property: &Value,
    definitions: Option<&Value>,
    depth: usize,
) -> Option<ParameterType> {
    match property.get("type") {
        Some(Value::String(ty)) => ParameterType::from_schema_type(ty),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .filter(|ty| *ty != "null")
            .find_map(ParameterType::from_schema_type),
        Some(_) => None,
        None => {
            // Referenced types and unions, e.g. `Option<SomeStruct>`.
            let variants = property
                .get("anyOf")
                .or_else(|| property.get("oneOf"))
                .and_then(Value::as_array);
            if let Some(variants) = variants {
                return variants.iter().find_map(|variant| {
                    property_type(variant, definitions, depth)
                });
            }
            if let Some(reference) = property.get("$ref") {
                let target = reference
                    .as_str()
                    .and_then(|r| resolve_ref(r, definitions))
                    .filter(|_| depth < MAX_REF_DEPTH);
                return match target {
                    Some(target) => {
                        property_type(target, definitions, depth + 1)
                    }
                    None => Some(ParameterType::Object),
                };
            }
            if property.get("enum").is_some() {
                return Some(ParameterType::String);
            }
            None
        }
    }
}

const MAX_REF_DEPTH: usize = 8;

/// Finds the definition a local reference such as `#/$defs/Point` points
/// to.
fn resolve_ref<'a>(
    reference: &str,
    definitions: Option<&'a Value>,
) -> Option<&'a Value> {
    let name = reference
        .strip_prefix("#/$defs/")
        .or_else(|| reference.strip_prefix("#/definitions/"))?;
    definitions?.get(name)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use schemars::{JsonSchema, schema_for};
    use serde::Deserialize;

    use super::*;
    use crate::tool::ErrorKind;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct Params {
        /// The first operand.
        a: i64,
        /// The second operand.
        b: i64,
        scale: Option<f64>,
        verbose: Option<bool>,
    }

    fn schema() -> ParameterSchema {
        let schema = schema_for!(Params).to_value();
        ParameterSchema::from_json_schema(&schema).unwrap()
    }

    #[test]
    fn test_reads_schemars_schema() {
        let schema = schema();
        let names: Vec<_> =
            schema.parameters().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "scale", "verbose"]);

        let a = &schema.parameters()[0];
        assert_eq!(a.ty, ParameterType::Integer);
        assert!(a.required);
        assert_eq!(a.description.as_deref(), Some("The first operand."));

        let scale = &schema.parameters()[2];
        assert_eq!(scale.ty, ParameterType::Number);
        assert!(!scale.required);
        assert_eq!(schema.parameters()[3].ty, ParameterType::Boolean);
    }

    #[test]
    fn test_exported_schema_keeps_order() {
        let exported = schema().to_json_schema();
        let keys: Vec<_> = exported["properties"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(keys, ["a", "b", "scale", "verbose"]);
        assert_eq!(exported["required"], json!(["a", "b"]));
        assert_eq!(exported["type"], "object");
    }

    #[test]
    fn test_coercion() {
        let schema = schema();
        let coerced = schema
            .validate(&json!({
                "a": "4",
                "b": 7.0,
                "scale": "0.5",
                "verbose": "TRUE",
            }))
            .unwrap();
        assert_eq!(
            coerced,
            json!({ "a": 4, "b": 7, "scale": 0.5, "verbose": true })
        );

        let coerced =
            schema.validate(&json!({ "a": 1, "b": 2, "scale": null })).unwrap();
        assert_eq!(coerced, json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn test_rejections() {
        let schema = schema();
        let cases = [
            (json!({ "a": 1 }), "missing required argument `b`"),
            (json!({ "a": 1, "b": 2.5 }), "argument `b` must be integer"),
            (json!({ "a": 1, "b": 2, "c": 3 }), "unexpected argument `c`"),
            (json!([1, 2]), "arguments must be an object"),
            (json!("{\"a\": 1"), "arguments must be an object"),
        ];
        for (arguments, expected) in cases {
            let err = schema.validate(&arguments).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
            assert!(
                err.reason().contains(expected),
                "{} does not contain {expected}",
                err.reason()
            );
        }
    }

    #[test]
    fn test_integer_range() {
        let coerce = |value: Value| ParameterType::Integer.coerce(&value);
        // 2^53 and -2^63 are exact integers.
        assert_eq!(
            coerce(json!(9_007_199_254_740_992.0)),
            Some(json!(9_007_199_254_740_992_i64))
        );
        assert_eq!(
            coerce(json!(-9.223_372_036_854_775_808e18)),
            Some(json!(i64::MIN))
        );
        // 2^63 is one past `i64::MAX`.
        assert_eq!(coerce(json!(9.223_372_036_854_775_808e18)), None);
        assert_eq!(coerce(json!(1.0e19)), None);
    }

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct Point {
        x: i64,
        y: i64,
    }

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    enum Unit {
        Meters,
        Feet,
    }

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct Move {
        to: Point,
        from: Option<Point>,
        unit: Unit,
    }

    #[test]
    fn test_referenced_types() {
        let schema = schema_for!(Move).to_value();
        let schema = ParameterSchema::from_json_schema(&schema).unwrap();
        let types: Vec<_> = schema.parameters().iter().map(|p| p.ty).collect();
        assert_eq!(
            types,
            [
                ParameterType::Object,
                ParameterType::Object,
                ParameterType::String
            ]
        );

        let coerced = schema
            .validate(&json!({ "to": { "x": 1, "y": 2 }, "unit": "Feet" }))
            .unwrap();
        assert_eq!(coerced["to"], json!({ "x": 1, "y": 2 }));
        assert!(schema.to_json_schema()["$defs"].get("Point").is_some());

        let err = schema
            .validate(&json!({ "to": "1,2", "unit": "Feet" }))
            .unwrap_err();
        assert!(err.reason().contains("argument `to` must be object"));
    }

    #[test]
    fn test_unresolved_reference_is_an_object() {
        let schema = ParameterSchema::from_json_schema(&json!({
            "type": "object",
            "properties": { "p": { "$ref": "#/$defs/Missing" } }
        }))
        .unwrap();
        assert_eq!(schema.parameters()[0].ty, ParameterType::Object);
    }

    #[test]
    fn test_null_arguments_without_parameters() {
        let schema = ParameterSchema::from_json_schema(&json!({
            "type": "object",
            "properties": {}
        }))
        .unwrap();
        assert_eq!(schema.validate(&Value::Null).unwrap(), json!({}));
    }

    #[test]
    fn test_invalid_schemas() {
        assert_eq!(
            ParameterSchema::from_json_schema(&json!({ "type": "string" })),
            Err(SchemaError::NotAnObject)
        );
        assert_eq!(
            ParameterSchema::from_json_schema(&json!({
                "type": "object",
                "properties": { "x": { "type": "date" } }
            })),
            Err(SchemaError::UnsupportedType("x".to_owned()))
        );
    }
}
