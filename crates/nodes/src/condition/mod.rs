//! Constrained condition expressions.
//!
//! Comparisons, boolean connectives, literals and lookups only:
//! - `intent == 'search'`
//! - `node.fetch.status >= 400 or trigger.force`
//! - `not (tags contains 'spam')`

mod ast;
mod evaluator;
mod parser;

pub use ast::{CompareOp, Expression, Literal, Operand};
pub use evaluator::evaluate;
pub use parser::{parse, ParseError};
