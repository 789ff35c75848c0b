use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use serde_json::Value;
use toolloop_model::ModelTool;

use super::object::{ToolFuture, ToolObject, ToolObjectImpl};
use super::{Error, ParameterSchema, SchemaError, Tool};

/// Errors from registering or looking up tools.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A tool with the same name is already registered.
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
    /// No tool is registered under the name.
    #[error("tool `{0}` is not registered")]
    UnknownTool(String),
    /// The parameter schema of the tool cannot be used.
    #[error("tool `{name}` has an invalid parameter schema: {source}")]
    InvalidSchema {
        /// Name of the tool.
        name: String,
        /// What is wrong with the schema.
        source: SchemaError,
    },
}

/// A tool stored in a [`ToolRegistry`], along with its parsed parameters.
#[derive(Clone)]
pub struct RegisteredTool {
    object: Arc<dyn ToolObject>,
    schema: ParameterSchema,
}

impl RegisteredTool {
    /// Returns the name of the tool.
    #[inline]
    pub fn name(&self) -> &str {
        self.object.name()
    }

    /// Returns the description of the tool.
    #[inline]
    pub fn description(&self) -> &str {
        self.object.description()
    }

    /// Returns the typed parameters of the tool.
    #[inline]
    pub fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    /// Returns the declaration advertised to the model.
    pub fn declaration(&self) -> ModelTool {
        ModelTool {
            name: self.name().to_owned(),
            description: self.description().to_owned(),
            parameters: self.schema.to_json_schema(),
        }
    }

    /// Validates the arguments and starts executing the tool.
    ///
    /// Validation failures resolve to an `InvalidInput` error without
    /// running the tool. The returned future does not borrow the registry.
    pub fn invoke(&self, arguments: &Value) -> ToolFuture {
        match self.schema.validate(arguments) {
            Ok(arguments) => Arc::clone(&self.object).execute(arguments),
            Err(err) => Box::pin(std::future::ready(Err(err))),
        }
    }
}

impl Debug for RegisteredTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.name())
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// A set of named tools, kept in registration order.
///
/// Registration happens before the agent starts. Afterwards the registry is
/// only read, so it can be shared freely.
#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool.
    ///
    /// Fails if the name is taken or the parameter schema is not the schema
    /// of an object with typed properties.
    pub fn register<T: Tool>(&mut self, tool: T) -> Result<(), RegistryError> {
        let name = tool.name().to_owned();
        if self.index.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        let schema = ParameterSchema::from_json_schema(tool.parameter_schema())
            .map_err(|source| RegistryError::InvalidSchema {
                name: name.clone(),
                source,
            })?;

        debug!("registered tool `{name}`");
        self.index.insert(name, self.tools.len());
        self.tools.push(RegisteredTool {
            object: Arc::new(ToolObjectImpl(tool)),
            schema,
        });
        Ok(())
    }

    /// Registers a tool, builder style.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Result<Self, RegistryError> {
        self.register(tool)?;
        Ok(self)
    }

    /// Looks up a tool by its exact name.
    pub fn lookup(&self, name: &str) -> Result<&RegisteredTool, RegistryError> {
        self.index
            .get(name)
            .map(|&idx| &self.tools[idx])
            .ok_or_else(|| RegistryError::UnknownTool(name.to_owned()))
    }

    /// Returns the declarations of all tools, in registration order.
    pub fn list_declarations(&self) -> Vec<ModelTool> {
        self.tools.iter().map(RegisteredTool::declaration).collect()
    }

    /// Starts a call of the named tool.
    ///
    /// An unregistered name resolves to an `UnknownTool` error.
    pub(crate) fn invoke(&self, name: &str, arguments: &Value) -> ToolFuture {
        match self.lookup(name) {
            Ok(tool) => tool.invoke(arguments),
            Err(_) => {
                let err = Error::unknown_tool()
                    .with_reason(format!("no tool named `{name}`"));
                Box::pin(std::future::ready(Err(err)))
            }
        }
    }

    /// Returns the number of registered tools.
    #[inline]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no tool is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use schemars::{JsonSchema, schema_for};
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::tool::{ErrorKind, ToolResult};

    #[derive(Deserialize, JsonSchema)]
    struct Operands {
        a: i64,
        b: i64,
    }

    static OPERANDS_SCHEMA: LazyLock<Value> =
        LazyLock::new(|| schema_for!(Operands).to_value());

    struct Add;

    impl Tool for Add {
        type Input = Operands;

        fn name(&self) -> &str {
            "add"
        }

        fn description(&self) -> &str {
            "Adds two integers."
        }

        fn parameter_schema(&self) -> &Value {
            &OPERANDS_SCHEMA
        }

        fn execute(
            &self,
            input: Operands,
        ) -> impl Future<Output = ToolResult> + Send + 'static {
            async move { Ok((input.a + input.b).to_string()) }
        }
    }

    struct Named(&'static str, Value);

    impl Tool for Named {
        type Input = Value;

        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "Does nothing."
        }

        fn parameter_schema(&self) -> &Value {
            &self.1
        }

        fn execute(
            &self,
            _input: Value,
        ) -> impl Future<Output = ToolResult> + Send + 'static {
            async { Ok(String::new()) }
        }
    }

    fn empty_schema() -> Value {
        json!({ "type": "object", "properties": {} })
    }

    #[test]
    fn test_declarations_in_registration_order() {
        let registry = ToolRegistry::new()
            .with_tool(Named("zeta", empty_schema()))
            .unwrap()
            .with_tool(Add)
            .unwrap()
            .with_tool(Named("alpha", empty_schema()))
            .unwrap();

        let names: Vec<_> = registry
            .list_declarations()
            .into_iter()
            .map(|decl| decl.name)
            .collect();
        assert_eq!(names, ["zeta", "add", "alpha"]);

        let add = registry.lookup("add").unwrap().declaration();
        assert_eq!(add.description, "Adds two integers.");
        assert_eq!(add.parameters["required"], json!(["a", "b"]));
    }

    #[test]
    fn test_register_errors() {
        let mut registry = ToolRegistry::new();
        registry.register(Add).unwrap();
        assert_eq!(
            registry.register(Add),
            Err(RegistryError::DuplicateTool("add".to_owned()))
        );
        assert!(matches!(
            registry.register(Named("bad", json!({ "type": "array" }))),
            Err(RegistryError::InvalidSchema { name, .. }) if name == "bad"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_is_exact() {
        let registry = ToolRegistry::new().with_tool(Add).unwrap();
        assert!(registry.lookup("add").is_ok());
        assert_eq!(
            registry.lookup("Add").unwrap_err(),
            RegistryError::UnknownTool("Add".to_owned())
        );
    }

    #[tokio::test]
    async fn test_invoke() {
        let registry = ToolRegistry::new().with_tool(Add).unwrap();

        let result = registry.invoke("add", &json!({ "a": "2", "b": 3 })).await;
        assert_eq!(result.unwrap(), "5");

        let err = registry.invoke("add", &json!({ "a": 2 })).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = registry.invoke("divide", &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTool);
    }
}
