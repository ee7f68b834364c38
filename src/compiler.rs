//! Resolves abstract patterns and rule inheritance into a flat, executable
//! schema.
//!
//! The source document is never modified; every compilation builds a new
//! tree with fresh query slots.

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::error::{SchemaError, SchemaResult};
use crate::query::QueryLanguage;
use crate::schema::{ALL_PHASE, Let, MessagePart, Pattern, Rule, SchematronDocument};

/// A schema with no abstract patterns, no abstract rules and no `extends`.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    document: SchematronDocument,
    language: QueryLanguage,
}

/// The patterns and phase variables selected for one validation run.
#[derive(Debug)]
pub struct ActivePhase<'a> {
    pub id: String,
    pub patterns: Vec<&'a Pattern>,
    pub lets: &'a [Let],
}

impl CompiledSchema {
    pub fn document(&self) -> &SchematronDocument {
        &self.document
    }

    pub fn language(&self) -> QueryLanguage {
        self.language
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.document.patterns
    }

    /// Resolve the requested phase, falling back to the schema's default
    /// phase and then to `#ALL`.
    pub fn resolve_phase(&self, requested: Option<&str>) -> SchemaResult<ActivePhase<'_>> {
        let id = requested
            .or(self.document.default_phase.as_deref())
            .unwrap_or(ALL_PHASE);

        if id == ALL_PHASE {
            return Ok(ActivePhase {
                id: id.to_string(),
                patterns: self.document.patterns.iter().collect(),
                lets: &[],
            });
        }

        let phase = self
            .document
            .phases
            .get(id)
            .ok_or_else(|| SchemaError::UnknownPhase(id.to_string()))?;
        let active: HashSet<&str> = phase.active_patterns.iter().map(String::as_str).collect();
        Ok(ActivePhase {
            id: id.to_string(),
            patterns: self
                .document
                .patterns
                .iter()
                .filter(|p| p.id.as_deref().is_some_and(|id| active.contains(id)))
                .collect(),
            lets: &phase.lets,
        })
    }
}

/// Compile a parsed schema.
pub fn compile(source: &SchematronDocument) -> SchemaResult<CompiledSchema> {
    let language = QueryLanguage::from_binding(source.query_binding.as_deref())?;
    check_pattern_ids(source)?;
    check_phases(source)?;

    let declared_lets = declared_let_names(source);

    let mut patterns = Vec::with_capacity(source.patterns.len());
    for pattern in &source.patterns {
        if pattern.is_abstract {
            continue;
        }
        match &pattern.base_pattern_id {
            Some(base) => patterns.push(instantiate(source, pattern, base, &declared_lets)?),
            None => patterns.push(pattern.clone()),
        }
    }

    let resolver = ExtensionResolver {
        patterns: &patterns,
    };
    let mut compiled = Vec::with_capacity(patterns.len());
    for (index, pattern) in patterns.iter().enumerate() {
        let mut rules = Vec::with_capacity(pattern.rules.len());
        for rule in pattern.rules.iter().filter(|rule| !rule.is_abstract) {
            rules.push(resolver.flatten(index, rule)?);
        }
        compiled.push(Pattern {
            rules,
            is_abstract: false,
            base_pattern_id: None,
            parameters: Default::default(),
            ..pattern.clone()
        });
    }

    debug!(
        patterns = compiled.len(),
        language = language.name(),
        "compiled schema"
    );

    Ok(CompiledSchema {
        document: SchematronDocument {
            patterns: compiled,
            ..source.clone()
        },
        language,
    })
}

fn check_pattern_ids(source: &SchematronDocument) -> SchemaResult<()> {
    let mut seen = HashSet::new();
    for id in source.patterns.iter().filter_map(|p| p.id.as_deref()) {
        if !seen.insert(id) {
            return Err(SchemaError::DuplicatePatternId(id.to_string()));
        }
    }
    Ok(())
}

fn check_phases(source: &SchematronDocument) -> SchemaResult<()> {
    for phase in source.phases.values() {
        for active in &phase.active_patterns {
            match source.pattern(active) {
                None => {
                    return Err(SchemaError::UnknownActivePattern {
                        phase: phase.id.clone(),
                        pattern: active.clone(),
                    });
                }
                Some(pattern) if pattern.is_abstract => {
                    return Err(SchemaError::AbstractActivePattern {
                        phase: phase.id.clone(),
                        pattern: active.clone(),
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Names bound by `let` anywhere in the schema; `$name` references to these
/// are variables, not pattern parameters.
fn declared_let_names(source: &SchematronDocument) -> HashSet<String> {
    let phase_lets = source.phases.values().flat_map(|phase| &phase.lets);
    let pattern_lets = source.patterns.iter().flat_map(|pattern| {
        pattern
            .lets
            .iter()
            .chain(pattern.rules.iter().flat_map(|rule| &rule.lets))
    });
    source
        .lets
        .iter()
        .chain(phase_lets)
        .chain(pattern_lets)
        .map(|l| l.name.clone())
        .collect()
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Split `text` into literal runs and `$name` references. String literals
/// are copied through untouched.
fn scan_references(text: &str, mut on_reference: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        if c == '\'' || c == '"' {
            out.push(c);
            for (_, inner) in chars.by_ref() {
                out.push(inner);
                if inner == c {
                    break;
                }
            }
            continue;
        }
        if c != '$' || !chars.peek().is_some_and(|&(_, next)| is_name_start(next)) {
            out.push(c);
            continue;
        }
        let name_start = start + 1;
        let mut end = name_start;
        while let Some(&(offset, next)) = chars.peek() {
            if !is_name_char(next) {
                break;
            }
            end = offset + next.len_utf8();
            chars.next();
        }
        let name = &text[name_start..end];
        match on_reference(name) {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(&text[start..end]),
        }
    }
    out
}

/// Replace whole `$name` tokens that name a parameter with its value.
pub fn substitute_parameters(text: &str, parameters: &std::collections::BTreeMap<String, String>) -> String {
    scan_references(text, |name| parameters.get(name).cloned())
}

/// `$name` tokens used in `text`.
fn references(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    scan_references(text, |name| {
        names.push(name.to_string());
        None
    });
    names
}

fn pattern_queries(pattern: &Pattern) -> Vec<&str> {
    let mut queries = Vec::new();
    for l in &pattern.lets {
        queries.push(l.value.source());
    }
    for rule in &pattern.rules {
        queries.push(rule.context.source());
        queries.extend(rule.lets.iter().map(|l| l.value.source()));
        for assertion in &rule.assertions {
            queries.push(assertion.test.source());
            for part in &assertion.message.parts {
                match part {
                    MessagePart::ValueOf(slot) | MessagePart::Name(slot) => {
                        queries.push(slot.source())
                    }
                    MessagePart::Text(_) => {}
                }
            }
        }
    }
    queries
}

fn instantiate(
    source: &SchematronDocument,
    instance: &Pattern,
    base_id: &str,
    declared_lets: &HashSet<String>,
) -> SchemaResult<Pattern> {
    let instance_id = instance.id_or_default().to_string();
    let base = source
        .pattern(base_id)
        .filter(|p| p.is_abstract)
        .ok_or_else(|| SchemaError::UnresolvedPattern {
            pattern: instance_id.clone(),
            base: base_id.to_string(),
        })?;

    let required: BTreeSet<String> = pattern_queries(base)
        .into_iter()
        .flat_map(references)
        .filter(|name| !declared_lets.contains(name))
        .collect();
    if let Some(missing) = required
        .iter()
        .find(|name| !instance.parameters.contains_key(*name))
    {
        return Err(SchemaError::MissingParameter {
            pattern: instance_id,
            base: base_id.to_string(),
            parameter: missing.clone(),
        });
    }

    let substitute = |text: &str| substitute_parameters(text, &instance.parameters);
    debug!(pattern = %instance_id, base = base_id, "instantiating abstract pattern");

    Ok(Pattern {
        id: instance.id.clone(),
        title: instance.title.clone().or_else(|| base.title.clone()),
        is_abstract: false,
        base_pattern_id: None,
        parameters: Default::default(),
        lets: base
            .lets
            .iter()
            .map(|l| Let {
                name: l.name.clone(),
                value: l.value.map_source(substitute),
            })
            .chain(instance.lets.iter().cloned())
            .collect(),
        rules: base
            .rules
            .iter()
            .map(|rule| rule.map_queries(&substitute))
            .collect(),
    })
}

struct ExtensionResolver<'a> {
    patterns: &'a [Pattern],
}

fn rule_label(rule: &Rule) -> String {
    rule.id
        .clone()
        .unwrap_or_else(|| format!("rule[@context='{}']", rule.context.source()))
}

impl<'a> ExtensionResolver<'a> {
    /// Find an extension target: the rule's own pattern first, then every
    /// pattern in document order.
    fn find(&self, pattern: usize, id: &str) -> Option<(usize, &'a Rule)> {
        let in_pattern = |index: usize| {
            self.patterns[index]
                .rules
                .iter()
                .find(|rule| rule.id.as_deref() == Some(id))
                .map(|rule| (index, rule))
        };
        in_pattern(pattern).or_else(|| (0..self.patterns.len()).find_map(in_pattern))
    }

    fn flatten(&self, pattern: usize, rule: &Rule) -> SchemaResult<Rule> {
        let mut visiting = vec![rule_label(rule)];
        let (lets, assertions) = self.resolve(pattern, rule, &mut visiting)?;
        Ok(Rule {
            id: rule.id.clone(),
            context: rule.context.clone(),
            is_abstract: false,
            extends: Vec::new(),
            lets,
            assertions,
        })
    }

    /// Depth-first, base-first merge of `rule` and everything it extends.
    fn resolve(
        &self,
        pattern: usize,
        rule: &Rule,
        visiting: &mut Vec<String>,
    ) -> SchemaResult<(Vec<Let>, Vec<crate::schema::Assertion>)> {
        let mut lets: Vec<Let> = Vec::new();
        let mut assertions = Vec::new();

        for target in &rule.extends {
            if visiting.iter().any(|label| label == target) {
                let mut chain = visiting.clone();
                chain.push(target.clone());
                return Err(SchemaError::CyclicExtension { chain });
            }
            let (target_pattern, base) =
                self.find(pattern, target)
                    .ok_or_else(|| SchemaError::UnresolvedRule {
                        rule: rule_label(rule),
                        target: target.clone(),
                    })?;

            visiting.push(target.clone());
            let (base_lets, base_assertions) = self.resolve(target_pattern, base, visiting)?;
            visiting.pop();

            merge_lets(&mut lets, base_lets);
            assertions.extend(base_assertions);
        }

        merge_lets(&mut lets, rule.lets.iter().cloned());
        assertions.extend(rule.assertions.iter().cloned());
        Ok((lets, assertions))
    }
}

/// Append `incoming`, a later binding replacing an earlier one of the same
/// name.
fn merge_lets(lets: &mut Vec<Let>, incoming: impl IntoIterator<Item = Let>) {
    for binding in incoming {
        lets.retain(|existing| existing.name != binding.name);
        lets.push(binding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_schema;
    use crate::schema::{Assertion, AssertionKind, Phase};
    use pretty_assertions::assert_eq;

    fn tests_of(rule: &Rule) -> Vec<&str> {
        rule.assertions.iter().map(|a| a.test.source()).collect()
    }

    fn assertion(test: &str) -> Assertion {
        Assertion::new(AssertionKind::Assert, test, test)
    }

    #[test]
    fn test_extension_chain_is_base_first() {
        let schema = SchematronDocument::default().with_pattern(
            Pattern::new("p")
                .with_rule(Rule::abstract_rule("A").with_assertion(assertion("a1")))
                .with_rule(
                    Rule::abstract_rule("B")
                        .extending("A")
                        .with_assertion(assertion("b1")),
                )
                .with_rule(
                    Rule::new("doc")
                        .with_id("C")
                        .extending("B")
                        .with_assertion(assertion("c1")),
                ),
        );

        let compiled = compile(&schema).unwrap();
        let rules = &compiled.patterns()[0].rules;
        assert_eq!(rules.len(), 1);
        assert_eq!(tests_of(&rules[0]), vec!["a1", "b1", "c1"]);

        // Repeated compilation is deterministic.
        let again = compile(&schema).unwrap();
        assert_eq!(tests_of(&again.patterns()[0].rules[0]), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_multiple_extends_in_order_across_patterns() {
        let schema = SchematronDocument::default()
            .with_pattern(
                Pattern::new("shared")
                    .with_rule(Rule::abstract_rule("X").with_assertion(assertion("x1")))
                    .with_rule(Rule::abstract_rule("Y").with_assertion(assertion("y1"))),
            )
            .with_pattern(
                Pattern::new("main").with_rule(
                    Rule::new("doc")
                        .extending("Y")
                        .extending("X")
                        .with_assertion(assertion("own")),
                ),
            );
        let compiled = compile(&schema).unwrap();
        assert!(compiled.patterns()[0].rules.is_empty());
        assert_eq!(tests_of(&compiled.patterns()[1].rules[0]), vec!["y1", "x1", "own"]);
    }

    #[test]
    fn test_extends_prefers_own_pattern() {
        let schema = SchematronDocument::default()
            .with_pattern(
                Pattern::new("first")
                    .with_rule(Rule::abstract_rule("R").with_assertion(assertion("other"))),
            )
            .with_pattern(
                Pattern::new("second")
                    .with_rule(Rule::abstract_rule("R").with_assertion(assertion("local")))
                    .with_rule(Rule::new("doc").extending("R")),
            );
        let compiled = compile(&schema).unwrap();
        assert_eq!(tests_of(&compiled.patterns()[1].rules[0]), vec!["local"]);
    }

    #[test]
    fn test_cyclic_extension_is_detected() {
        let schema = SchematronDocument::default().with_pattern(
            Pattern::new("p")
                .with_rule(Rule::abstract_rule("A").extending("B"))
                .with_rule(Rule::abstract_rule("B").extending("A"))
                .with_rule(Rule::new("doc").with_id("C").extending("A")),
        );
        assert_eq!(
            compile(&schema).unwrap_err(),
            SchemaError::CyclicExtension {
                chain: vec!["C".into(), "A".into(), "B".into(), "A".into()],
            }
        );
    }

    #[test]
    fn test_unresolved_extends_target() {
        let schema = SchematronDocument::default()
            .with_pattern(Pattern::new("p").with_rule(Rule::new("doc").with_id("r").extending("missing")));
        assert_eq!(
            compile(&schema).unwrap_err(),
            SchemaError::UnresolvedRule {
                rule: "r".into(),
                target: "missing".into(),
            }
        );
    }

    #[test]
    fn test_inherited_lets_merge_base_first() {
        let schema = SchematronDocument::default().with_pattern(
            Pattern::new("p")
                .with_rule(
                    Rule::abstract_rule("base")
                        .with_let("a", "1")
                        .with_let("b", "2"),
                )
                .with_rule(Rule::new("doc").extending("base").with_let("a", "10")),
        );
        let compiled = compile(&schema).unwrap();
        let lets: Vec<(&str, &str)> = compiled.patterns()[0].rules[0]
            .lets
            .iter()
            .map(|l| (l.name.as_str(), l.value.source()))
            .collect();
        assert_eq!(lets, vec![("b", "2"), ("a", "10")]);
    }

    const ABSTRACT: &str = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron">
      <let name="limit" value="3"/>
      <pattern abstract="true" id="has-prefix">
        <rule context="$context">
          <assert test="starts-with(@$attribute,'x') and count(*) &lt; $limit">bad <value-of select="@$attribute"/></assert>
        </rule>
      </pattern>
      <pattern id="ids" is-a="has-prefix">
        <param name="context" value="foo"/>
        <param name="attribute" value="id"/>
      </pattern>
    </schema>"#;

    #[test]
    fn test_abstract_pattern_instantiation() {
        let source = parse_schema(ABSTRACT).unwrap();
        let compiled = compile(&source).unwrap();
        assert_eq!(compiled.patterns().len(), 1);

        let pattern = &compiled.patterns()[0];
        assert_eq!(pattern.id.as_deref(), Some("ids"));
        let rule = &pattern.rules[0];
        assert_eq!(rule.context.source(), "foo");
        let test = rule.assertions[0].test.source();
        assert!(test.contains("@id"));
        assert!(test.contains("$limit"));
        assert!(matches!(
            &rule.assertions[0].message.parts[1],
            MessagePart::ValueOf(slot) if slot.source() == "@id"
        ));

        // The parsed source is untouched.
        assert_eq!(source.patterns.len(), 2);
        assert_eq!(source.patterns[0].rules[0].context.source(), "$context");
    }

    #[test]
    fn test_missing_parameter() {
        let text = ABSTRACT.replace(r#"<param name="attribute" value="id"/>"#, "");
        let source = parse_schema(&text).unwrap();
        assert_eq!(
            compile(&source).unwrap_err(),
            SchemaError::MissingParameter {
                pattern: "ids".into(),
                base: "has-prefix".into(),
                parameter: "attribute".into(),
            }
        );
    }

    #[test]
    fn test_unresolved_base_pattern() {
        let text = ABSTRACT.replace(r#"is-a="has-prefix""#, r#"is-a="nowhere""#);
        let source = parse_schema(&text).unwrap();
        assert!(matches!(
            compile(&source),
            Err(SchemaError::UnresolvedPattern { base, .. }) if base == "nowhere"
        ));
    }

    #[test]
    fn test_substitution_respects_token_boundaries() {
        let mut parameters = std::collections::BTreeMap::new();
        parameters.insert("a".to_string(), "x".to_string());
        parameters.insert("ab".to_string(), "y".to_string());
        assert_eq!(
            substitute_parameters("$a + $ab + $abc + '$' + $a-b", &parameters),
            "x + y + $abc + '$' + $a-b"
        );
        assert_eq!(
            substitute_parameters(r#"concat('$a', "$ab's", $a)"#, &parameters),
            r#"concat('$a', "$ab's", x)"#
        );
    }

    #[test]
    fn test_dollar_inside_string_literal_is_not_a_parameter() {
        let text = ABSTRACT.replace(
            "starts-with(@$attribute,'x')",
            "starts-with(@$attribute,'x') and not(contains(., '$price'))",
        );
        let compiled = compile(&parse_schema(&text).unwrap()).unwrap();
        let test = compiled.patterns()[0].rules[0].assertions[0].test.source();
        assert!(test.contains("@id"));
        assert!(test.contains("'$price'"));
    }

    #[test]
    fn test_phase_checks_and_resolution() {
        let mut schema = SchematronDocument::default()
            .with_pattern(Pattern::new("p1"))
            .with_pattern(Pattern::new("p2"));
        schema.phases.insert(
            "only-p2".into(),
            Phase {
                id: "only-p2".into(),
                active_patterns: vec!["p2".into()],
                lets: vec![Let::new("mode", "'strict'")],
            },
        );
        schema.default_phase = Some("only-p2".into());

        let compiled = compile(&schema).unwrap();
        let phase = compiled.resolve_phase(None).unwrap();
        assert_eq!(phase.id, "only-p2");
        assert_eq!(phase.patterns.len(), 1);
        assert_eq!(phase.lets.len(), 1);
        assert_eq!(compiled.resolve_phase(Some(ALL_PHASE)).unwrap().patterns.len(), 2);
        assert_eq!(
            compiled.resolve_phase(Some("nightly")).unwrap_err(),
            SchemaError::UnknownPhase("nightly".into())
        );

        schema.phases.get_mut("only-p2").unwrap().active_patterns.push("p9".into());
        assert!(matches!(
            compile(&schema),
            Err(SchemaError::UnknownActivePattern { .. })
        ));
    }

    #[test]
    fn test_duplicate_pattern_ids() {
        let schema = SchematronDocument::default()
            .with_pattern(Pattern::new("p"))
            .with_pattern(Pattern::new("p"));
        assert_eq!(
            compile(&schema).unwrap_err(),
            SchemaError::DuplicatePatternId("p".into())
        );
    }
}
