//! In-memory Schematron schema.
//!
//! Every query expression in the model lives in a [`QuerySlot`], which
//! compiles its source at most once and shares the result between all
//! validation runs that use the schema.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::EvalResult;
use crate::query::CompiledQuery;

/// ISO/IEC 19757-3 namespace.
pub const ISO_NAMESPACE: &str = "http://purl.oclc.org/dsdl/schematron";

/// Schematron 1.5 namespace.
pub const SCHEMATRON_15_NAMESPACE: &str = "http://www.ascc.net/xml/schematron";

/// Synthetic phase that activates every pattern.
pub const ALL_PHASE: &str = "#ALL";

/// A query expression with a compute-once compiled form.
pub struct QuerySlot {
    source: String,
    cell: Mutex<Option<Arc<CompiledQuery>>>,
}

impl QuerySlot {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            cell: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Return the compiled query, compiling it under the slot's lock on
    /// first use. A failed compilation leaves the slot empty.
    pub fn get_or_compile<F>(&self, compile: F) -> EvalResult<Arc<CompiledQuery>>
    where
        F: FnOnce(&str) -> EvalResult<CompiledQuery>,
    {
        let mut cell = self.cell.lock();
        if let Some(compiled) = cell.as_ref() {
            return Ok(Arc::clone(compiled));
        }
        let compiled = Arc::new(compile(&self.source)?);
        *cell = Some(Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn is_compiled(&self) -> bool {
        self.cell.lock().is_some()
    }

    /// A new slot whose source is `f(source)`, not yet compiled.
    pub fn map_source(&self, f: impl FnOnce(&str) -> String) -> Self {
        Self::new(f(&self.source))
    }
}

impl Clone for QuerySlot {
    // The compiled form belongs to the original; a copy compiles afresh.
    fn clone(&self) -> Self {
        Self::new(self.source.clone())
    }
}

impl PartialEq for QuerySlot {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Debug for QuerySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySlot")
            .field("source", &self.source)
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceDefinition {
    pub prefix: String,
    pub uri: String,
}

/// A `let` variable: a name bound to an expression evaluated on first use.
#[derive(Debug, Clone, PartialEq)]
pub struct Let {
    pub name: String,
    pub value: QuerySlot,
}

impl Let {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: QuerySlot::new(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text(String),
    /// `<value-of select="..."/>`
    ValueOf(QuerySlot),
    /// `<name/>` or `<name path="..."/>`; the slot holds `name(path)`.
    Name(QuerySlot),
}

/// Mixed-content message of an assertion or diagnostic.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![MessagePart::Text(text.into())],
        }
    }

    fn map_queries(&self, f: &impl Fn(&str) -> String) -> Self {
        let parts = self
            .parts
            .iter()
            .map(|part| match part {
                MessagePart::Text(text) => MessagePart::Text(text.clone()),
                MessagePart::ValueOf(slot) => MessagePart::ValueOf(slot.map_source(f)),
                MessagePart::Name(slot) => MessagePart::Name(slot.map_source(f)),
            })
            .collect();
        Self { parts }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssertionKind {
    Assert,
    Report,
}

impl AssertionKind {
    /// Whether a test result produces a diagnostic: an assert fires when its
    /// test is false, a report when it is true.
    pub fn fires(self, test: bool) -> bool {
        match self {
            AssertionKind::Assert => !test,
            AssertionKind::Report => test,
        }
    }
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssertionKind::Assert => f.write_str("assert"),
            AssertionKind::Report => f.write_str("report"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
    pub id: Option<String>,
    pub kind: AssertionKind,
    pub test: QuerySlot,
    pub message: Message,
    pub diagnostics: Vec<String>,
    pub role: Option<String>,
    pub flag: Option<String>,
    pub subject: Option<String>,
    pub icon: Option<String>,
}

impl Assertion {
    pub fn new(kind: AssertionKind, test: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            test: QuerySlot::new(test),
            message: Message::text(message),
            diagnostics: Vec::new(),
            role: None,
            flag: None,
            subject: None,
            icon: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: Option<String>,
    /// Context pattern; empty for abstract rules.
    pub context: QuerySlot,
    pub is_abstract: bool,
    /// Ids of the rules this one extends, in document order.
    pub extends: Vec<String>,
    pub lets: Vec<Let>,
    pub assertions: Vec<Assertion>,
}

impl Rule {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            id: None,
            context: QuerySlot::new(context),
            is_abstract: false,
            extends: Vec::new(),
            lets: Vec::new(),
            assertions: Vec::new(),
        }
    }

    /// An abstract rule with no context, only reachable through `extends`.
    pub fn abstract_rule(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            is_abstract: true,
            ..Self::new("")
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_assertion(mut self, assertion: Assertion) -> Self {
        self.assertions.push(assertion);
        self
    }

    pub fn with_let(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.lets.push(Let::new(name, value));
        self
    }

    pub fn extending(mut self, target: impl Into<String>) -> Self {
        self.extends.push(target.into());
        self
    }

    /// Context is a bare variable reference such as `$items`.
    pub fn context_is_variable(&self) -> bool {
        self.context.source().trim_start().starts_with('$')
    }

    /// Copy with every query expression passed through `f`.
    pub fn map_queries(&self, f: &impl Fn(&str) -> String) -> Self {
        Self {
            id: self.id.clone(),
            context: self.context.map_source(f),
            is_abstract: self.is_abstract,
            extends: self.extends.clone(),
            lets: self
                .lets
                .iter()
                .map(|l| Let {
                    name: l.name.clone(),
                    value: l.value.map_source(f),
                })
                .collect(),
            assertions: self
                .assertions
                .iter()
                .map(|a| Assertion {
                    test: a.test.map_source(f),
                    message: a.message.map_queries(f),
                    ..a.clone()
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pattern {
    pub id: Option<String>,
    pub title: Option<String>,
    pub is_abstract: bool,
    /// `is-a`: the abstract pattern this one instantiates.
    pub base_pattern_id: Option<String>,
    pub parameters: BTreeMap<String, String>,
    pub lets: Vec<Let>,
    pub rules: Vec<Rule>,
}

impl Pattern {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn id_or_default(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Phase {
    pub id: String,
    pub active_patterns: Vec<String>,
    pub lets: Vec<Let>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub id: String,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchematronDocument {
    pub id: Option<String>,
    pub title: Option<String>,
    pub schema_version: Option<String>,
    /// `queryBinding` attribute as written.
    pub query_binding: Option<String>,
    pub default_phase: Option<String>,
    pub namespaces: Vec<NamespaceDefinition>,
    pub lets: Vec<Let>,
    pub phases: BTreeMap<String, Phase>,
    pub diagnostics: BTreeMap<String, Diagnostic>,
    pub patterns: Vec<Pattern>,
}

impl SchematronDocument {
    pub fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn with_namespace(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.namespaces.push(NamespaceDefinition {
            prefix: prefix.into(),
            uri: uri.into(),
        });
        self
    }

    pub fn pattern(&self, id: &str) -> Option<&Pattern> {
        self.patterns.iter().find(|p| p.id.as_deref() == Some(id))
    }
}
