use std::sync::LazyLock;

use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;
use toolloop_core::tool::{Error as ToolError, Tool, ToolResult};

/// The operands of an arithmetic tool.
#[derive(Deserialize, JsonSchema)]
pub struct ArithmeticParameters {
    #[schemars(description = "The first operand.")]
    a: i64,
    #[schemars(description = "The second operand.")]
    b: i64,
}

static PARAMETER_SCHEMA: LazyLock<Value> =
    LazyLock::new(|| schema_for!(ArithmeticParameters).to_value());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operation {
    Add,
    Subtract,
    Multiply,
}

/// A tool doing one operation on two 64-bit integers.
///
/// Overflows are reported as execution errors instead of wrapping.
#[derive(Clone, Debug)]
pub struct ArithmeticTool {
    operation: Operation,
}

impl ArithmeticTool {
    /// Creates the `add` tool.
    #[inline]
    pub fn add() -> Self {
        Self {
            operation: Operation::Add,
        }
    }

    /// Creates the `subtract` tool.
    #[inline]
    pub fn subtract() -> Self {
        Self {
            operation: Operation::Subtract,
        }
    }

    /// Creates the `multiply` tool.
    #[inline]
    pub fn multiply() -> Self {
        Self {
            operation: Operation::Multiply,
        }
    }

    fn apply(&self, a: i64, b: i64) -> ToolResult {
        let result = match self.operation {
            Operation::Add => a.checked_add(b),
            Operation::Subtract => a.checked_sub(b),
            Operation::Multiply => a.checked_mul(b),
        };
        match result {
            Some(result) => Ok(result.to_string()),
            None => Err(ToolError::execution_error().with_reason(format!(
                "{} of {a} and {b} overflows",
                self.name()
            ))),
        }
    }
}

impl Tool for ArithmeticTool {
    type Input = ArithmeticParameters;

    fn name(&self) -> &str {
        match self.operation {
            Operation::Add => "add",
            Operation::Subtract => "subtract",
            Operation::Multiply => "multiply",
        }
    }

    fn description(&self) -> &str {
        match self.operation {
            Operation::Add => "Adds two integers and returns the sum.",
            Operation::Subtract => {
                "Subtracts the second integer from the first and returns the \
                 difference."
            }
            Operation::Multiply => {
                "Multiplies two integers and returns the product."
            }
        }
    }

    fn parameter_schema(&self) -> &Value {
        &PARAMETER_SCHEMA
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let result = self.apply(input.a, input.b);
        trace!("{} {} {} = {result:?}", self.name(), input.a, input.b);
        std::future::ready(result)
    }
}

/// Returns `add`, `subtract` and `multiply`, in this order.
pub fn arithmetic_tools() -> [ArithmeticTool; 3] {
    [
        ArithmeticTool::add(),
        ArithmeticTool::subtract(),
        ArithmeticTool::multiply(),
    ]
}
