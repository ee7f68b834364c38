//! Query language bindings.
//!
//! Every binding evaluates through the same XPath 1.0 engine and differs in
//! the extension functions it registers and in whether expressions pass
//! through the XPath 2.0 rewriter first.

pub mod context;
pub mod functions;
pub mod node;

pub use context::MatchContext;

use sxd_document::dom::Document;
use sxd_xpath::nodeset::Node;
use tracing::debug;

use crate::compiler::CompiledSchema;
use crate::error::{EvalResult, SchemaError, SchemaResult};
use crate::expr::{self, Emitter, Expr, anchor_pattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryLanguage {
    /// Plain XPath 1.0.
    XPath,
    /// XPath 1.0 plus XSLT's `current()`.
    Xslt,
    /// The XPath 2.0 subset, rewritten to XPath 1.0.
    XPath2,
}

impl QueryLanguage {
    /// Pick the binding for a schema's `queryBinding` attribute. A schema
    /// without one uses XSLT, the ISO default.
    pub fn from_binding(binding: Option<&str>) -> SchemaResult<Self> {
        let Some(binding) = binding else {
            return Ok(QueryLanguage::Xslt);
        };
        match binding.trim().to_ascii_lowercase().as_str() {
            "xpath" | "xpath1" => Ok(QueryLanguage::XPath),
            "" | "xslt" | "xslt1" => Ok(QueryLanguage::Xslt),
            "xpath2" | "xpath3" | "xpath31" | "xslt2" | "xslt3" => Ok(QueryLanguage::XPath2),
            _ => Err(SchemaError::UnsupportedQueryBinding(binding.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueryLanguage::XPath => "xpath",
            QueryLanguage::Xslt => "xslt",
            QueryLanguage::XPath2 => "xpath2",
        }
    }

    fn supports_current(self) -> bool {
        matches!(self, QueryLanguage::Xslt | QueryLanguage::XPath2)
    }

    /// Compile an expression evaluated relative to a node: assertion
    /// tests, `let` values and message selects.
    pub fn compile(self, source: &str) -> EvalResult<CompiledQuery> {
        let parsed = expr::parse(source)?;
        let variable_ref = match &parsed.expr {
            Expr::VariableRef(name) => Some(name.clone()),
            _ => None,
        };

        let (text, rewritten) = if self == QueryLanguage::XPath2 {
            let mut emitter = Emitter::new(true);
            let emitted = emitter.emit(&parsed.expr);
            if parsed.xpath2_syntax || emitter.rewrite_required() {
                (emitted, true)
            } else {
                (source.trim().to_string(), false)
            }
        } else {
            (source.trim().to_string(), false)
        };

        if rewritten {
            debug!(source, text = %text, "rewrote XPath 2.0 expression");
        }

        Ok(CompiledQuery {
            source: source.to_string(),
            text,
            rewritten,
            variables: parsed.expr.variables(),
            uses_current: self.supports_current() && parsed.expr.calls("current", 0),
            variable_ref,
        })
    }

    /// Compile a rule context. A bare `$variable` stays a variable
    /// reference; anything else becomes a selection from the root.
    pub fn compile_pattern(self, source: &str) -> EvalResult<CompiledQuery> {
        let parsed = expr::parse(source)?;
        if let Expr::VariableRef(name) = &parsed.expr {
            return Ok(CompiledQuery {
                source: source.to_string(),
                text: source.trim().to_string(),
                rewritten: false,
                variables: vec![name.clone()],
                uses_current: false,
                variable_ref: Some(name.clone()),
            });
        }

        let anchored = anchor_pattern(&parsed.expr);
        let mut emitter = Emitter::new(self == QueryLanguage::XPath2);
        let text = emitter.emit(&anchored);

        Ok(CompiledQuery {
            source: source.to_string(),
            text,
            rewritten: true,
            variables: anchored.variables(),
            uses_current: self.supports_current() && anchored.calls("current", 0),
            variable_ref: None,
        })
    }

    /// Per-document evaluation state for one validation run.
    pub fn create_match_context<'d>(
        self,
        schema: &CompiledSchema,
        instance: &Document<'d>,
    ) -> MatchContext<'d> {
        MatchContext::new(
            self,
            schema.document().namespaces.clone(),
            Node::Root(instance.root()),
        )
    }
}

/// A query expression ready for the evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub source: String,
    /// XPath 1.0 text handed to the evaluator.
    pub text: String,
    pub rewritten: bool,
    /// Variables referenced anywhere in the expression.
    pub variables: Vec<String>,
    pub uses_current: bool,
    /// Set when the whole expression is a single `$name`.
    pub variable_ref: Option<String>,
}

impl CompiledQuery {
    /// A query evaluated exactly as written.
    pub fn verbatim(source: &str) -> Self {
        Self {
            source: source.to_string(),
            text: source.trim().to_string(),
            rewritten: false,
            variables: Vec::new(),
            uses_current: false,
            variable_ref: None,
        }
    }
}
