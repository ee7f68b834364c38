//! Serializes an [`Expr`] back to XPath 1.0 text.

use super::ast::{Axis, BinaryOp, Expr, NodeTest, PathExpr, PathStart, Step, quote_literal};

/// Name of the helper function that implements XPath 2.0 ordering
/// comparison on XPath 1.0 engines.
pub const COMPARE_FUNCTION: &str = "rewrite-compare";

pub struct Emitter {
    rewrite_comparisons: bool,
    rewrite_required: bool,
}

impl Emitter {
    /// With `rewrite_comparisons` set, ordering comparisons between operands
    /// that are not numeric literals go through [`COMPARE_FUNCTION`].
    pub fn new(rewrite_comparisons: bool) -> Self {
        Self {
            rewrite_comparisons,
            rewrite_required: false,
        }
    }

    /// Whether any emitted construct differs from a verbatim copy.
    pub fn rewrite_required(&self) -> bool {
        self.rewrite_required
    }

    pub fn emit(&mut self, expr: &Expr) -> String {
        match expr {
            Expr::Literal(value) => quote_literal(value),
            Expr::Number(value) => value.clone(),
            Expr::VariableRef(name) => format!("${}", name),
            Expr::FunctionCall { name, args } => {
                let args: Vec<String> = args.iter().map(|arg| self.emit(arg)).collect();
                format!("{}({})", name, args.join(", "))
            }
            Expr::Negate(operand) => format!("-{}", self.emit(operand)),
            Expr::Binary { op, left, right } => self.binary(*op, left, right),
            Expr::Union { left, right } => {
                let right = self.emit(right);
                match left {
                    Some(left) => format!("{} | {}", self.emit(left), right),
                    None => right,
                }
            }
            Expr::Group(inner) => format!("({})", self.emit(inner)),
            Expr::Sequence(items) => {
                self.rewrite_required = true;
                if items.is_empty() {
                    // A path that selects nothing stands in for `()`.
                    return "/..".to_string();
                }
                let folded = items.iter().cloned().fold(None, |acc, item| {
                    Some(Box::new(Expr::Union {
                        left: acc,
                        right: Box::new(item),
                    }))
                });
                match folded {
                    Some(union) => format!("({})", self.emit(&union)),
                    None => "/..".to_string(),
                }
            }
            Expr::Filter {
                primary,
                predicates,
            } => {
                let mut out = self.emit(primary);
                for predicate in predicates {
                    out.push('[');
                    out.push_str(&self.emit(predicate));
                    out.push(']');
                }
                out
            }
            Expr::Path(path) => self.path(path),
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> String {
        let numeric = is_numeric_literal(left) || is_numeric_literal(right);
        let left = self.emit(left);
        let right = self.emit(right);
        if self.rewrite_comparisons && op.is_ordering() && !numeric {
            self.rewrite_required = true;
            return format!("{}({}, {}) {} 0", COMPARE_FUNCTION, left, right, op.symbol());
        }
        format!("{} {} {}", left, op.symbol(), right)
    }

    fn path(&mut self, path: &PathExpr) -> String {
        let mut out = match &path.start {
            PathStart::Root => "/".to_string(),
            PathStart::Relative => String::new(),
            PathStart::Filter(start) => self.emit(start),
        };

        for (index, step) in path.steps.iter().enumerate() {
            let last = index + 1 == path.steps.len();
            if !last && !out.is_empty() && is_plain_descendant(step) {
                out.push_str(if out.ends_with('/') { "/" } else { "//" });
                continue;
            }
            if !out.is_empty() && !out.ends_with('/') {
                out.push('/');
            }
            let step = self.step(step);
            out.push_str(&step);
        }
        out
    }

    fn step(&mut self, step: &Step) -> String {
        let mut out = match (step.axis, &step.test) {
            (Axis::SelfAxis, NodeTest::Node) if step.predicates.is_empty() => ".".to_string(),
            (Axis::Parent, NodeTest::Node) if step.predicates.is_empty() => "..".to_string(),
            (Axis::Child, test) => test.to_string(),
            (Axis::Attribute, test) => format!("@{}", test),
            (axis, test) => format!("{}::{}", axis.name(), test),
        };
        for predicate in &step.predicates {
            out.push('[');
            out.push_str(&self.emit(predicate));
            out.push(']');
        }
        out
    }
}

/// A number literal, possibly negated or parenthesised. Names such as
/// `inf` or `NaN` are element tests, not numbers.
fn is_numeric_literal(expr: &Expr) -> bool {
    match expr {
        Expr::Number(_) => true,
        Expr::Negate(inner) | Expr::Group(inner) => is_numeric_literal(inner),
        _ => false,
    }
}

fn is_plain_descendant(step: &Step) -> bool {
    step.axis == Axis::DescendantOrSelf && step.test == NodeTest::Node && step.predicates.is_empty()
}

/// Turn a rule context pattern into an expression that selects every node
/// the pattern matches when evaluated from the document root.
///
/// Relative branches are anchored with `//`; absolute and variable-rooted
/// branches are kept as written.
pub fn anchor_pattern(expr: &Expr) -> Expr {
    match expr {
        Expr::Union { left, right } => Expr::Union {
            left: left.as_ref().map(|left| Box::new(anchor_pattern(left))),
            right: Box::new(anchor_pattern(right)),
        },
        Expr::Group(inner) => Expr::Group(Box::new(anchor_pattern(inner))),
        Expr::Sequence(items) => Expr::Sequence(items.iter().map(anchor_pattern).collect()),
        Expr::Path(PathExpr {
            start: PathStart::Relative,
            steps,
        }) => {
            let mut anchored = Vec::with_capacity(steps.len() + 1);
            anchored.push(Step::descendant_or_self());
            anchored.extend(steps.iter().cloned());
            Expr::Path(PathExpr {
                start: PathStart::Root,
                steps: anchored,
            })
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parser::parse;

    fn emit(source: &str, rewrite: bool) -> (String, bool) {
        let parsed = parse(source).unwrap();
        let mut emitter = Emitter::new(rewrite);
        let text = emitter.emit(&parsed.expr);
        (text, emitter.rewrite_required())
    }

    #[test]
    fn test_abbreviated_steps_are_preserved() {
        assert_eq!(
            emit("foo[count(@a) > 0]/..//bar", true),
            ("foo[count(@a) > 0]/..//bar".to_string(), false)
        );
        assert_eq!(emit("/", false).0, "/");
        assert_eq!(emit("//x", false).0, "//x");
        assert_eq!(emit(".//x", false).0, ".//x");
    }

    #[test]
    fn test_ordering_comparison_on_non_numeric_operands() {
        assert_eq!(
            emit("@a < @b", true),
            ("rewrite-compare(@a, @b) < 0".to_string(), true)
        );
        assert_eq!(emit("@a < @b", false), ("@a < @b".to_string(), false));
    }

    #[test]
    fn test_ordering_comparison_with_number_is_native() {
        assert_eq!(emit("@a >= 20", true), ("@a >= 20".to_string(), false));
        assert!(!emit("-1.5 < @a", true).1);
        assert!(!emit("@a > (3)", true).1);
    }

    #[test]
    fn test_number_like_names_are_not_numbers() {
        assert_eq!(
            emit("inf < @b", true),
            ("rewrite-compare(inf, @b) < 0".to_string(), true)
        );
        assert!(emit("@a > NaN", true).1);
        assert!(emit("infinity <= @a", true).1);
    }

    #[test]
    fn test_sequence_becomes_union() {
        assert_eq!(emit("(@a, @b, c)", true).0, "(@a | @b | c)");
        assert_eq!(emit("()", true).0, "/..");
    }

    #[test]
    fn test_value_comparison_uses_general_operator() {
        assert_eq!(emit("@a eq 'x'", true).0, "@a = 'x'");
        assert_eq!(emit("@a lt 'x'", true).0, "rewrite-compare(@a, 'x') < 0");
    }

    #[test]
    fn test_explicit_axes() {
        assert_eq!(
            emit("ancestor::node()[1]/following-sibling::x:item", false).0,
            "ancestor::node()[1]/following-sibling::x:item"
        );
    }

    #[test]
    fn test_anchor_pattern() {
        let anchored = |source: &str| {
            let parsed = parse(source).unwrap();
            Emitter::new(false).emit(&anchor_pattern(&parsed.expr))
        };
        assert_eq!(anchored("foo"), "//foo");
        assert_eq!(anchored("foo | @id"), "//foo | //@id");
        assert_eq!(anchored("/"), "/");
        assert_eq!(anchored("/doc/item"), "/doc/item");
        assert_eq!(anchored("*/bar[1]"), "//*/bar[1]");
    }
}
