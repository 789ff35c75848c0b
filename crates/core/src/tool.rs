//! Tool call supports.

mod error;
mod object;
mod registry;
mod schema;

use serde::de::DeserializeOwned;
use serde_json::Value;

pub use error::{Error, ErrorKind};
pub use registry::{RegisteredTool, RegistryError, ToolRegistry};
pub use schema::{Parameter, ParameterSchema, ParameterType, SchemaError};

/// The result of a tool call.
pub type ToolResult = Result<String, Error>;

/// A tool that can be called by the model.
///
/// Implementations of this trait should be stateless, and may not maintain any
/// internal state. Once registered, a tool is never mutated.
///
/// The parameter schema is a JSON schema of an object, typically generated
/// with `schemars::schema_for!` from the `Input` type. The registry reads the
/// ordered list of typed parameters from it, validates and coerces the
/// arguments the model sends, and only then deserializes them into `Input`.
pub trait Tool: Send + Sync + 'static {
    /// The type of input that the tool accepts.
    type Input: DeserializeOwned;

    /// Returns the name of the tool.
    fn name(&self) -> &str;

    /// Returns the description of the tool.
    fn description(&self) -> &str;

    /// Returns the parameter schema of the tool.
    fn parameter_schema(&self) -> &Value;

    /// Executes the tool with the given input.
    ///
    /// This method must return a future that is fully independent of `self`,
    /// and the future should be cancellation safe.
    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static;
}
