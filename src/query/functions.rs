//! Extension functions registered on the XPath 1.0 evaluator by the XSLT
//! and XPath 2.0 query bindings.

use std::cmp::Ordering;

use sxd_xpath::context::Evaluation;
use sxd_xpath::function::{Error, Function};
use sxd_xpath::nodeset::Nodeset;
use sxd_xpath::{Context, Value};

use super::QueryLanguage;
use super::node::NodeAddress;
use crate::expr::COMPARE_FUNCTION;

fn exactly(args: &[Value<'_>], expected: usize) -> Result<(), Error> {
    match args.len().cmp(&expected) {
        Ordering::Equal => Ok(()),
        Ordering::Less => Err(Error::NotEnoughArguments {
            expected,
            actual: args.len(),
        }),
        Ordering::Greater => Err(Error::TooManyArguments {
            expected,
            actual: args.len(),
        }),
    }
}

fn single<'d>(mut args: Vec<Value<'d>>) -> Result<Value<'d>, Error> {
    exactly(&args, 1)?;
    args.pop()
        .ok_or_else(|| Error::Other("missing argument".to_string()))
}

/// XSLT `current()`: the node the outermost expression is evaluated on.
pub struct Current {
    address: NodeAddress,
}

impl Current {
    pub fn new(address: NodeAddress) -> Self {
        Self { address }
    }
}

impl Function for Current {
    fn evaluate<'c, 'd>(
        &self,
        context: &Evaluation<'c, 'd>,
        args: Vec<Value<'d>>,
    ) -> Result<Value<'d>, Error> {
        exactly(&args, 0)?;
        let node = self
            .address
            .resolve(context.node)
            .ok_or_else(|| Error::Other("current() node is not in this document".to_string()))?;
        let mut nodes = Nodeset::new();
        nodes.add(node);
        Ok(Value::Nodeset(nodes))
    }
}

/// `exists($seq)`; a non-node value is a one-item sequence.
struct Exists;

impl Function for Exists {
    fn evaluate<'c, 'd>(
        &self,
        _context: &Evaluation<'c, 'd>,
        args: Vec<Value<'d>>,
    ) -> Result<Value<'d>, Error> {
        Ok(Value::Boolean(match single(args)? {
            Value::Nodeset(nodes) => nodes.size() > 0,
            _ => true,
        }))
    }
}

struct Empty;

impl Function for Empty {
    fn evaluate<'c, 'd>(
        &self,
        _context: &Evaluation<'c, 'd>,
        args: Vec<Value<'d>>,
    ) -> Result<Value<'d>, Error> {
        Ok(Value::Boolean(match single(args)? {
            Value::Nodeset(nodes) => nodes.size() == 0,
            _ => false,
        }))
    }
}

/// `distinct-values($nodes)` keeps the first node, in document order, of
/// each distinct string value.
struct DistinctValues;

impl Function for DistinctValues {
    fn evaluate<'c, 'd>(
        &self,
        _context: &Evaluation<'c, 'd>,
        args: Vec<Value<'d>>,
    ) -> Result<Value<'d>, Error> {
        match single(args)? {
            Value::Nodeset(nodes) => {
                let mut seen = std::collections::HashSet::new();
                let mut distinct = Nodeset::new();
                for node in nodes.document_order() {
                    if seen.insert(node.string_value()) {
                        distinct.add(node);
                    }
                }
                Ok(Value::Nodeset(distinct))
            }
            other => Ok(other),
        }
    }
}

struct ChangeCase {
    upper: bool,
}

impl Function for ChangeCase {
    fn evaluate<'c, 'd>(
        &self,
        _context: &Evaluation<'c, 'd>,
        args: Vec<Value<'d>>,
    ) -> Result<Value<'d>, Error> {
        let value = single(args)?.string();
        Ok(Value::String(if self.upper {
            value.to_uppercase()
        } else {
            value.to_lowercase()
        }))
    }
}

/// Operand of an XPath 2.0 general comparison after atomisation.
#[derive(Debug, Clone, PartialEq)]
enum Atom {
    Missing,
    Number(f64),
    Text(String),
}

impl Atom {
    fn from_value(value: &Value<'_>) -> Self {
        match value {
            Value::Nodeset(nodes) => match nodes.document_order().first() {
                Some(node) => Atom::Text(node.string_value()),
                None => Atom::Missing,
            },
            Value::Number(n) => Atom::Number(*n),
            Value::Boolean(b) => Atom::Number(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => Atom::Text(s.clone()),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Atom::Missing => None,
            Atom::Number(n) => Some(*n),
            Atom::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    fn as_text(&self) -> String {
        match self {
            Atom::Missing => String::new(),
            Atom::Number(n) => Value::Number(*n).string(),
            Atom::Text(s) => s.clone(),
        }
    }
}

/// Compare two operands the way an XPath 2.0 general comparison would:
/// numerically when both convert to numbers, otherwise by code point.
/// Returns -1, 0 or 1, or NaN when either side is an empty sequence or the
/// numbers are unordered.
pub fn compare_values(left: &Value<'_>, right: &Value<'_>) -> f64 {
    let left = Atom::from_value(left);
    let right = Atom::from_value(right);
    if left == Atom::Missing || right == Atom::Missing {
        return f64::NAN;
    }
    let ordering = match (left.as_number(), right.as_number()) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => Some(left.as_text().cmp(&right.as_text())),
    };
    match ordering {
        Some(Ordering::Less) => -1.0,
        Some(Ordering::Equal) => 0.0,
        Some(Ordering::Greater) => 1.0,
        None => f64::NAN,
    }
}

struct RewriteCompare;

impl Function for RewriteCompare {
    fn evaluate<'c, 'd>(
        &self,
        _context: &Evaluation<'c, 'd>,
        args: Vec<Value<'d>>,
    ) -> Result<Value<'d>, Error> {
        exactly(&args, 2)?;
        Ok(Value::Number(compare_values(&args[0], &args[1])))
    }
}

/// Register the binding's extension functions. `current()` is registered
/// separately because it is bound to a node.
pub fn register(context: &mut Context<'_>, language: QueryLanguage) {
    if language == QueryLanguage::XPath2 {
        context.set_function("exists", Exists);
        context.set_function("empty", Empty);
        context.set_function("distinct-values", DistinctValues);
        context.set_function("lower-case", ChangeCase { upper: false });
        context.set_function("upper-case", ChangeCase { upper: true });
        context.set_function(COMPARE_FUNCTION, RewriteCompare);
    }
}
