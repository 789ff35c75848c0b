//! A set of built-in tools that models can use.

mod arithmetic;

pub use arithmetic::{ArithmeticTool, arithmetic_tools};
