//! XPath 2.0 subset to XPath 1.0 rewriter.
//!
//! Expressions written against an XPath 2.0 query binding are parsed and
//! re-emitted as XPath 1.0 text the evaluator understands. Expressions that
//! need no change come back exactly as written, minus surrounding whitespace.

pub mod ast;
pub mod emit;
pub mod lexer;
pub mod parser;

pub use ast::Expr;
pub use emit::{COMPARE_FUNCTION, Emitter, anchor_pattern};
pub use parser::{Parsed, parse};

use crate::error::ParseError;

/// Result of [`rewrite`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub expression: String,
    pub rewrite_required: bool,
}

/// Rewrite an XPath 2.0 expression into XPath 1.0.
///
/// Ordering comparisons whose operands are not numeric literals are routed
/// through the `rewrite-compare` function, which the evaluator registers for
/// XPath 2.0 schemas.
pub fn rewrite(expression: &str) -> Result<Rewrite, ParseError> {
    let parsed = parse(expression)?;
    let mut emitter = Emitter::new(true);
    let emitted = emitter.emit(&parsed.expr);
    let rewrite_required = parsed.xpath2_syntax || emitter.rewrite_required();

    Ok(Rewrite {
        expression: if rewrite_required {
            emitted
        } else {
            expression.trim().to_string()
        },
        rewrite_required,
    })
}
