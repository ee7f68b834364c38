//! Operator tree for the XPath dialect accepted by the rewriter.
//!
//! The tree covers XPath 1.0 plus the XPath 2.0 constructs that show up in
//! real-world schemas: parenthesised sequences, the `union` keyword and the
//! value comparison operators (`eq`, `lt`, ...).

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// String literal, unquoted value.
    Literal(String),
    /// Numeric literal, source spelling.
    Number(String),
    VariableRef(String),
    FunctionCall {
        name: String,
        args: Vec<Expr>,
    },
    /// Unary minus.
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Node-set union. An absent left operand degenerates to the right one.
    Union {
        left: Option<Box<Expr>>,
        right: Box<Expr>,
    },
    /// A parenthesised single expression.
    Group(Box<Expr>),
    /// XPath 2.0 sequence constructor `(a, b, ...)`, including `()`.
    Sequence(Vec<Expr>),
    Filter {
        primary: Box<Expr>,
        predicates: Vec<Expr>,
    },
    Path(PathExpr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "div",
            BinaryOp::Mod => "mod",
        }
    }

    /// The ordering comparisons whose XPath 1.0 semantics differ from
    /// XPath 2.0 general comparisons on non-numeric operands.
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    pub start: PathStart,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathStart {
    /// Begins at the document root (`/...`).
    Root,
    /// Begins at the context node.
    Relative,
    /// Begins with a filter expression (`$x/foo`, `id('a')/b`).
    Filter(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<Expr>,
}

impl Step {
    pub fn new(axis: Axis, test: NodeTest) -> Self {
        Self {
            axis,
            test,
            predicates: Vec::new(),
        }
    }

    /// The step that `//` abbreviates.
    pub fn descendant_or_self() -> Self {
        Self::new(Axis::DescendantOrSelf, NodeTest::Node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Ancestor,
    AncestorOrSelf,
    Attribute,
    Child,
    Descendant,
    DescendantOrSelf,
    Following,
    FollowingSibling,
    Namespace,
    Parent,
    Preceding,
    PrecedingSibling,
    SelfAxis,
}

impl Axis {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "ancestor" => Axis::Ancestor,
            "ancestor-or-self" => Axis::AncestorOrSelf,
            "attribute" => Axis::Attribute,
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "following" => Axis::Following,
            "following-sibling" => Axis::FollowingSibling,
            "namespace" => Axis::Namespace,
            "parent" => Axis::Parent,
            "preceding" => Axis::Preceding,
            "preceding-sibling" => Axis::PrecedingSibling,
            "self" => Axis::SelfAxis,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Axis::Ancestor => "ancestor",
            Axis::AncestorOrSelf => "ancestor-or-self",
            Axis::Attribute => "attribute",
            Axis::Child => "child",
            Axis::Descendant => "descendant",
            Axis::DescendantOrSelf => "descendant-or-self",
            Axis::Following => "following",
            Axis::FollowingSibling => "following-sibling",
            Axis::Namespace => "namespace",
            Axis::Parent => "parent",
            Axis::Preceding => "preceding",
            Axis::PrecedingSibling => "preceding-sibling",
            Axis::SelfAxis => "self",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTest {
    /// `*`
    Wildcard,
    /// `prefix:*`
    PrefixWildcard(String),
    /// A (possibly prefixed) name.
    Name(String),
    Node,
    Text,
    Comment,
    ProcessingInstruction(Option<String>),
}

impl fmt::Display for NodeTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeTest::Wildcard => f.write_str("*"),
            NodeTest::PrefixWildcard(prefix) => write!(f, "{}:*", prefix),
            NodeTest::Name(name) => f.write_str(name),
            NodeTest::Node => f.write_str("node()"),
            NodeTest::Text => f.write_str("text()"),
            NodeTest::Comment => f.write_str("comment()"),
            NodeTest::ProcessingInstruction(None) => f.write_str("processing-instruction()"),
            NodeTest::ProcessingInstruction(Some(target)) => {
                write!(f, "processing-instruction({})", quote_literal(target))
            }
        }
    }
}

/// Quote a string value as an XPath 1.0 literal.
///
/// A value containing both quote characters has no single-literal spelling
/// and is emitted as a `concat()` of pieces.
pub fn quote_literal(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{}'", value)
    } else if !value.contains('"') {
        format!("\"{}\"", value)
    } else {
        let pieces: Vec<String> = value
            .split('\'')
            .map(|piece| format!("'{}'", piece))
            .collect();
        format!("concat({})", pieces.join(", \"'\", "))
    }
}

impl Expr {
    /// Variable names referenced anywhere in the expression, first use order.
    pub fn variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.visit(&mut |expr| {
            if let Expr::VariableRef(name) = expr
                && !names.contains(name)
            {
                names.push(name.clone());
            }
        });
        names
    }

    /// Whether the expression calls the named function with `arity` arguments.
    pub fn calls(&self, function: &str, arity: usize) -> bool {
        let mut found = false;
        self.visit(&mut |expr| {
            if let Expr::FunctionCall { name, args } = expr
                && name == function
                && args.len() == arity
            {
                found = true;
            }
        });
        found
    }

    fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Number(_) | Expr::VariableRef(_) => {}
            Expr::FunctionCall { args, .. } => {
                for arg in args {
                    arg.visit(f);
                }
            }
            Expr::Negate(operand) | Expr::Group(operand) => operand.visit(f),
            Expr::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::Union { left, right } => {
                if let Some(left) = left {
                    left.visit(f);
                }
                right.visit(f);
            }
            Expr::Sequence(items) => {
                for item in items {
                    item.visit(f);
                }
            }
            Expr::Filter {
                primary,
                predicates,
            } => {
                primary.visit(f);
                for predicate in predicates {
                    predicate.visit(f);
                }
            }
            Expr::Path(path) => {
                if let PathStart::Filter(start) = &path.start {
                    start.visit(f);
                }
                for predicate in path.steps.iter().flat_map(|step| &step.predicates) {
                    predicate.visit(f);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_literal_picks_quote_style() {
        assert_eq!(quote_literal("bar"), "'bar'");
        assert_eq!(quote_literal("it's"), "\"it's\"");
        assert_eq!(
            quote_literal(r#"a'b"c"#),
            r#"concat('a', "'", 'b"c')"#
        );
    }

    #[test]
    fn test_axis_names_round_trip() {
        for name in ["child", "descendant-or-self", "preceding-sibling", "self"] {
            assert_eq!(Axis::from_name(name).map(Axis::name), Some(name));
        }
        assert_eq!(Axis::from_name("sideways"), None);
    }

    #[test]
    fn test_variables_are_deduplicated_in_order() {
        let expr = Expr::Binary {
            op: BinaryOp::And,
            left: Box::new(Expr::VariableRef("b".into())),
            right: Box::new(Expr::FunctionCall {
                name: "f".into(),
                args: vec![Expr::VariableRef("a".into()), Expr::VariableRef("b".into())],
            }),
        };
        assert_eq!(expr.variables(), vec!["b".to_string(), "a".to_string()]);
        assert!(expr.calls("f", 2));
        assert!(!expr.calls("f", 0));
    }
}
