//! Runs a compiled schema against instance documents.
//!
//! One run walks the instance once in document order. At each node every
//! active pattern gets a chance to fire its first matching rule; a fired
//! rule evaluates its assertions in order and emits an event for each one
//! whose polarity check fails.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use serde::Serialize;
use sxd_document::dom::Document;
use sxd_xpath::nodeset::Node;
use tracing::{debug, trace, warn};

use crate::compiler::CompiledSchema;
use crate::error::{EvalResult, Result, ValidationError};
use crate::query::MatchContext;
use crate::query::node::{document_order, positional_path};
use crate::schema::{Assertion, AssertionKind, Let, Message, MessagePart, Pattern, Rule};

/// Per-run switches.
#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    /// Phase to run; `None` selects the schema's default phase.
    pub phase: Option<String>,
    /// Treat evaluation errors as "no diagnostic" instead of failing.
    pub lenient: bool,
    /// Checked between nodes; once set the run ends with
    /// [`ValidationError::Cancelled`].
    pub cancel: Option<Arc<AtomicBool>>,
}

impl ValidationOptions {
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedDiagnostic {
    pub id: String,
    pub message: String,
}

/// One failed assertion or successful report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationEvent {
    pub pattern_id: Option<String>,
    pub rule_id: Option<String>,
    pub assertion_id: Option<String>,
    pub kind: AssertionKind,
    pub test: String,
    pub message: String,
    /// Positional path of the node, e.g. `/doc/item[2]`.
    pub location: String,
    pub role: Option<String>,
    pub flag: Option<String>,
    pub diagnostic_ids: Vec<String>,
    pub diagnostics: Vec<RenderedDiagnostic>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub phase: String,
    pub events: Vec<ValidationEvent>,
    pub nodes_visited: usize,
}

impl ValidationReport {
    /// A document is valid when the run produced no events.
    pub fn is_valid(&self) -> bool {
        self.events.is_empty()
    }

    pub fn messages(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.message.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    PhaseSelected,
    Traversing,
    NodeEvaluated,
    Done,
    Failed,
}

/// Validates instance documents against one shared compiled schema.
#[derive(Debug, Clone)]
pub struct Validator {
    schema: Arc<CompiledSchema>,
    options: ValidationOptions,
}

impl Validator {
    pub fn new(schema: Arc<CompiledSchema>) -> Self {
        Self::with_options(schema, ValidationOptions::default())
    }

    pub fn with_options(schema: Arc<CompiledSchema>, options: ValidationOptions) -> Self {
        Self { schema, options }
    }

    pub fn schema(&self) -> &Arc<CompiledSchema> {
        &self.schema
    }

    pub fn options(&self) -> &ValidationOptions {
        &self.options
    }

    /// Parse and validate instance text.
    pub fn validate_str(&self, text: &str) -> Result<ValidationReport> {
        self.validate_named(text, Path::new("<input>"))
    }

    /// Parse and validate instance text read from `origin`.
    pub fn validate_named(&self, text: &str, origin: &Path) -> Result<ValidationReport> {
        let package =
            sxd_document::parser::parse(text).map_err(|err| ValidationError::InstanceParsing {
                file: origin.to_path_buf(),
                details: format!("{:?}", err),
            })?;
        self.validate_document(&package.as_document())
    }

    pub fn validate_document(&self, document: &Document<'_>) -> Result<ValidationReport> {
        Run::new(&self.schema, &self.options, document).execute()
    }

    /// Validate many instances in parallel. Results are in input order.
    pub fn validate_batch<S>(&self, instances: &[S]) -> Vec<Result<ValidationReport>>
    where
        S: AsRef<str> + Sync,
    {
        instances
            .par_iter()
            .map(|text| self.validate_str(text.as_ref()))
            .collect()
    }
}

struct Run<'s, 'd> {
    schema: &'s CompiledSchema,
    options: &'s ValidationOptions,
    context: MatchContext<'d>,
    state: RunState,
    events: Vec<ValidationEvent>,
}

impl<'s, 'd> Run<'s, 'd> {
    fn new(
        schema: &'s CompiledSchema,
        options: &'s ValidationOptions,
        document: &Document<'d>,
    ) -> Self {
        Self {
            schema,
            options,
            context: schema.language().create_match_context(schema, document),
            state: RunState::Idle,
            events: Vec::new(),
        }
    }

    fn transition(&mut self, next: RunState) {
        trace!(from = ?self.state, to = ?next, "run state");
        self.state = next;
    }

    fn cancelled(&self) -> bool {
        self.options
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn execute(&mut self) -> Result<ValidationReport> {
        let result = self.traverse();
        if result.is_err() {
            self.transition(RunState::Failed);
        }
        result
    }

    fn traverse(&mut self) -> Result<ValidationReport> {
        let schema = self.schema;
        let phase = schema.resolve_phase(self.options.phase.as_deref())?;
        debug!(phase = %phase.id, patterns = phase.patterns.len(), "selected phase");
        self.transition(RunState::PhaseSelected);

        let root = self.context.root();
        self.context.push_scope();
        self.bind_all(&schema.document().lets, root)?;
        self.bind_all(phase.lets, root)?;

        self.transition(RunState::Traversing);
        let nodes = document_order(root);
        for &node in &nodes {
            if self.cancelled() {
                return Err(ValidationError::Cancelled);
            }
            for pattern in &phase.patterns {
                self.visit(pattern, node)?;
            }
            self.transition(RunState::NodeEvaluated);
        }

        self.context.pop_scope()?;
        self.transition(RunState::Done);
        debug!(events = self.events.len(), nodes = nodes.len(), "run finished");

        Ok(ValidationReport {
            phase: phase.id,
            events: std::mem::take(&mut self.events),
            nodes_visited: nodes.len(),
        })
    }

    /// Swallow an evaluation error in lenient mode.
    fn tolerate<T>(&self, result: EvalResult<T>, fallback: T, what: &str) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) if self.options.lenient => {
                warn!(error = %err, "{} failed, continuing in lenient mode", what);
                Ok(fallback)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Bind `lets` in the innermost scope. In lenient mode a `let` whose
    /// expression does not compile is left unbound; scope errors stay fatal.
    fn bind_all(&mut self, lets: &[Let], node: Node<'d>) -> Result<()> {
        for binding in lets {
            match self.context.bind(binding, node) {
                Err(ValidationError::Evaluation(err)) => {
                    self.tolerate::<()>(Err(err), (), "let binding")?;
                }
                other => other?,
            }
        }
        Ok(())
    }

    fn visit(&mut self, pattern: &Pattern, node: Node<'d>) -> Result<()> {
        self.context.push_scope();
        let root = self.context.root();
        self.bind_all(&pattern.lets, root)?;

        for rule in &pattern.rules {
            let matched = self.context.matches(rule, node);
            if self.tolerate(matched, false, "rule context")? {
                trace!(
                    pattern = pattern.id_or_default(),
                    context = rule.context.source(),
                    "rule fired"
                );
                self.fire(pattern, rule, node)?;
                break;
            }
        }

        self.context.pop_scope()?;
        Ok(())
    }

    fn fire(&mut self, pattern: &Pattern, rule: &Rule, node: Node<'d>) -> Result<()> {
        self.context.push_scope();
        self.bind_all(&rule.lets, node)?;

        for assertion in &rule.assertions {
            let outcome = self.context.assert(assertion, node);
            if self.tolerate(outcome, false, "assertion")? {
                let event = self.event(pattern, rule, assertion, node)?;
                self.events.push(event);
            }
        }

        self.context.pop_scope()?;
        Ok(())
    }

    fn event(
        &mut self,
        pattern: &Pattern,
        rule: &Rule,
        assertion: &Assertion,
        node: Node<'d>,
    ) -> Result<ValidationEvent> {
        let schema = self.schema;
        let message = self.render(&assertion.message, node)?;

        let mut diagnostics = Vec::with_capacity(assertion.diagnostics.len());
        for id in &assertion.diagnostics {
            match schema.document().diagnostics.get(id) {
                Some(diagnostic) => diagnostics.push(RenderedDiagnostic {
                    id: id.clone(),
                    message: self.render(&diagnostic.message, node)?,
                }),
                None => warn!(diagnostic = %id, "assertion references unknown diagnostic"),
            }
        }

        Ok(ValidationEvent {
            pattern_id: pattern.id.clone(),
            rule_id: rule.id.clone(),
            assertion_id: assertion.id.clone(),
            kind: assertion.kind,
            test: assertion.test.source().to_string(),
            message,
            location: positional_path(node),
            role: assertion.role.clone(),
            flag: assertion.flag.clone(),
            diagnostic_ids: assertion.diagnostics.clone(),
            diagnostics,
        })
    }

    fn render(&mut self, message: &Message, node: Node<'d>) -> Result<String> {
        let mut text = String::new();
        for part in &message.parts {
            match part {
                MessagePart::Text(literal) => text.push_str(literal),
                MessagePart::ValueOf(slot) | MessagePart::Name(slot) => {
                    let value = self.context.evaluate_string(slot, node);
                    text.push_str(&self.tolerate(value, String::new(), "message")?);
                }
            }
        }
        Ok(text.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::parser::parse_schema;
    use pretty_assertions::assert_eq;

    fn validator(schema: &str) -> Validator {
        let compiled = compile(&parse_schema(schema).unwrap()).unwrap();
        Validator::new(Arc::new(compiled))
    }

    const FOO_MUST_BE_BAR: &str = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron">
      <pattern id="p">
        <rule context="//foo">
          <assert test=". = 'bar'">foo must be bar</assert>
        </rule>
      </pattern>
    </schema>"#;

    #[test]
    fn test_end_to_end_single_diagnostic() {
        let report = validator(FOO_MUST_BE_BAR)
            .validate_str("<document><a><foo>x</foo></a></document>")
            .unwrap();
        assert_eq!(report.messages(), vec!["foo must be bar"]);
        assert_eq!(report.events[0].location, "/document/a/foo");
        assert_eq!(report.events[0].kind, AssertionKind::Assert);
        assert!(!report.is_valid());

        let report = validator(FOO_MUST_BE_BAR)
            .validate_str("<document><foo>bar</foo></document>")
            .unwrap();
        assert!(report.is_valid());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let schema = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron">
          <pattern id="p">
            <rule context="item"><report test="true()">first</report></rule>
            <rule context="item"><report test="true()">second</report></rule>
          </pattern>
          <pattern id="q">
            <rule context="item"><report test="true()">other pattern</report></rule>
          </pattern>
        </schema>"#;
        let report = validator(schema).validate_str("<doc><item/></doc>").unwrap();
        assert_eq!(report.messages(), vec!["first", "other pattern"]);
    }

    #[test]
    fn test_rule_lets_shadow_schema_lets() {
        let schema = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron">
          <let name="x" value="'bar'"/>
          <pattern id="p">
            <rule context="inner">
              <let name="x" value="'not-bar'"/>
              <report test="true()">inner sees <value-of select="$x"/></report>
            </rule>
            <rule context="outer">
              <report test="true()">outer sees <value-of select="$x"/></report>
            </rule>
          </pattern>
        </schema>"#;
        let report = validator(schema)
            .validate_str("<doc><outer/><inner/><outer/></doc>")
            .unwrap();
        assert_eq!(
            report.messages(),
            vec!["outer sees bar", "inner sees not-bar", "outer sees bar"]
        );
    }

    #[test]
    fn test_message_rendering_and_metadata() {
        let schema = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron">
          <pattern id="p">
            <rule id="r" context="item">
              <assert id="a" test="@qty &gt; 0" role="error" flag="qty" diagnostics="d">
                <name/>   with id
                <value-of select="@id"/> has no quantity</assert>
            </rule>
          </pattern>
          <diagnostics>
            <diagnostic id="d">Found <value-of select="@qty"/></diagnostic>
          </diagnostics>
        </schema>"#;
        let report = validator(schema)
            .validate_str("<doc><item id='i1' qty='0'/><item id='i2' qty='4'/></doc>")
            .unwrap();
        assert_eq!(report.events.len(), 1);
        let event = &report.events[0];
        assert_eq!(event.message, "item with id i1 has no quantity");
        assert_eq!(event.pattern_id.as_deref(), Some("p"));
        assert_eq!(event.rule_id.as_deref(), Some("r"));
        assert_eq!(event.assertion_id.as_deref(), Some("a"));
        assert_eq!(event.role.as_deref(), Some("error"));
        assert_eq!(event.flag.as_deref(), Some("qty"));
        assert_eq!(event.test, "@qty > 0");
        assert_eq!(event.location, "/doc/item[1]");
        assert_eq!(
            event.diagnostics,
            vec![RenderedDiagnostic {
                id: "d".into(),
                message: "Found 0".into(),
            }]
        );
    }

    #[test]
    fn test_xpath2_comparisons() {
        let schema = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron" queryBinding="xslt2">
          <pattern>
            <rule context="doc">
              <report test="@a &lt; 20">numeric</report>
              <report test="@b &lt; @c">lexical</report>
              <report test="@c lt @b">never</report>
            </rule>
          </pattern>
        </schema>"#;
        let report = validator(schema)
            .validate_str("<doc a='3' b='alpha' c='beta'/>")
            .unwrap();
        assert_eq!(report.messages(), vec!["numeric", "lexical"]);
    }

    #[test]
    fn test_phases() {
        let schema = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron" defaultPhase="quick">
          <phase id="quick"><active pattern="a"/></phase>
          <phase id="full"><active pattern="a"/><active pattern="b"/></phase>
          <pattern id="a"><rule context="doc"><report test="true()">a</report></rule></pattern>
          <pattern id="b"><rule context="doc"><report test="true()">b</report></rule></pattern>
        </schema>"#;
        let compiled = Arc::new(compile(&parse_schema(schema).unwrap()).unwrap());

        let report = Validator::new(Arc::clone(&compiled))
            .validate_str("<doc/>")
            .unwrap();
        assert_eq!(report.phase, "quick");
        assert_eq!(report.messages(), vec!["a"]);

        let options = ValidationOptions::default().with_phase("#ALL");
        let report = Validator::with_options(Arc::clone(&compiled), options)
            .validate_str("<doc/>")
            .unwrap();
        assert_eq!(report.messages(), vec!["a", "b"]);

        let options = ValidationOptions::default().with_phase("nightly");
        let err = Validator::with_options(compiled, options)
            .validate_str("<doc/>")
            .unwrap_err();
        assert!(err.is_schema_error());
    }

    #[test]
    fn test_lenient_mode_swallows_evaluation_errors() {
        let schema = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron" queryBinding="xpath">
          <pattern>
            <rule context="doc">
              <assert test="$undefined">broken</assert>
              <assert test="false()">reported</assert>
            </rule>
          </pattern>
        </schema>"#;
        let compiled = Arc::new(compile(&parse_schema(schema).unwrap()).unwrap());

        let err = Validator::new(Arc::clone(&compiled))
            .validate_str("<doc/>")
            .unwrap_err();
        assert!(matches!(err, ValidationError::Evaluation(_)));

        let options = ValidationOptions::default().lenient(true);
        let report = Validator::with_options(compiled, options)
            .validate_str("<doc/>")
            .unwrap();
        assert_eq!(report.messages(), vec!["reported"]);
    }

    #[test]
    fn test_lenient_mode_skips_malformed_lets() {
        let schema = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron">
          <pattern id="first">
            <let name="y" value="count("/>
            <rule context="a">
              <let name="x" value="foo["/>
              <report test="true()">a fired</report>
              <report test="$x">never</report>
            </rule>
          </pattern>
          <pattern id="second">
            <rule context="b"><report test="true()">b fired</report></rule>
          </pattern>
        </schema>"#;
        let compiled = Arc::new(compile(&parse_schema(schema).unwrap()).unwrap());

        let err = Validator::new(Arc::clone(&compiled))
            .validate_str("<doc><a/><b/></doc>")
            .unwrap_err();
        assert!(matches!(err, ValidationError::Evaluation(_)));

        let options = ValidationOptions::default().lenient(true);
        let report = Validator::with_options(compiled, options)
            .validate_str("<doc><a/><b/></doc>")
            .unwrap();
        assert_eq!(report.messages(), vec!["a fired", "b fired"]);
    }

    #[test]
    fn test_variable_rule_context() {
        let schema = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron">
          <let name="flagged" value="//item[@flag]"/>
          <pattern>
            <rule context="$flagged"><report test="true()">flagged <value-of select="@id"/></report></rule>
          </pattern>
        </schema>"#;
        let report = validator(schema)
            .validate_str("<doc><item id='1'/><item id='2' flag='y'/></doc>")
            .unwrap();
        assert_eq!(report.messages(), vec!["flagged 2"]);
    }

    #[test]
    fn test_cancelled_run() {
        let cancel = Arc::new(AtomicBool::new(true));
        let compiled = Arc::new(compile(&parse_schema(FOO_MUST_BE_BAR).unwrap()).unwrap());
        let options = ValidationOptions::default().with_cancel(cancel);
        let err = Validator::with_options(compiled, options)
            .validate_str("<document/>")
            .unwrap_err();
        assert!(matches!(err, ValidationError::Cancelled));
    }

    #[test]
    fn test_instance_parse_error() {
        let err = validator(FOO_MUST_BE_BAR)
            .validate_str("<document>")
            .unwrap_err();
        assert!(matches!(err, ValidationError::InstanceParsing { .. }));
    }

    #[test]
    fn test_batch_shares_compiled_schema() {
        let validator = validator(FOO_MUST_BE_BAR);
        let instances: Vec<String> = (0..32)
            .map(|i| {
                if i % 2 == 0 {
                    "<document><foo>bar</foo></document>".to_string()
                } else {
                    "<document><foo>x</foo><foo>y</foo></document>".to_string()
                }
            })
            .collect();
        let reports = validator.validate_batch(&instances);
        for (i, report) in reports.into_iter().enumerate() {
            let report = report.unwrap();
            assert_eq!(report.events.len(), if i % 2 == 0 { 0 } else { 2 });
        }
        let rule = &validator.schema().patterns()[0].rules[0];
        assert!(rule.context.is_compiled());
    }

    #[test]
    fn test_run_state_machine() {
        let compiled = compile(&parse_schema(FOO_MUST_BE_BAR).unwrap()).unwrap();
        let package = sxd_document::parser::parse("<document><foo>x</foo></document>").unwrap();
        let document = package.as_document();

        let options = ValidationOptions::default();
        let mut run = Run::new(&compiled, &options, &document);
        assert_eq!(run.state, RunState::Idle);
        let report = run.execute().unwrap();
        assert_eq!(run.state, RunState::Done);
        assert_eq!(run.context.depth(), 0);
        assert_eq!(report.phase, "#ALL");
        assert_eq!(report.nodes_visited, 4);

        let options = ValidationOptions::default().with_phase("missing");
        let mut failing = Run::new(&compiled, &options, &document);
        assert!(failing.execute().is_err());
        assert_eq!(failing.state, RunState::Failed);
    }
}
