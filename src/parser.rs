//! Reads Schematron schema text into a [`SchematronDocument`].
//!
//! ISO Schematron and Schematron 1.5 are told apart by the namespace of the
//! root element. Documentation elements (`p`, foreign markup) are ignored;
//! `include` and other elements this engine does not execute are skipped
//! with a warning.

use roxmltree::{Document, Node, ParsingOptions};
use tracing::{debug, warn};

use crate::error::{SchemaError, SchemaResult};
use crate::schema::{
    Assertion, AssertionKind, Diagnostic, ISO_NAMESPACE, Let, Message, MessagePart,
    NamespaceDefinition, Pattern, Phase, QuerySlot, Rule, SCHEMATRON_15_NAMESPACE,
    SchematronDocument,
};

/// Which Schematron vocabulary a schema is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Iso,
    Schematron15,
}

impl Dialect {
    pub fn namespace(self) -> &'static str {
        match self {
            Dialect::Iso => ISO_NAMESPACE,
            Dialect::Schematron15 => SCHEMATRON_15_NAMESPACE,
        }
    }
}

/// Parse a schema from XML text.
pub fn parse_schema(text: &str) -> SchemaResult<SchematronDocument> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let xml = Document::parse_with_options(text, options)
        .map_err(|err| SchemaError::Xml(err.to_string()))?;
    let root = xml.root_element();

    let dialect = match root.tag_name().namespace() {
        Some(ISO_NAMESPACE) => Dialect::Iso,
        Some(SCHEMATRON_15_NAMESPACE) => Dialect::Schematron15,
        other => {
            return Err(SchemaError::Malformed(format!(
                "root element {{{}}}{} is not a Schematron schema",
                other.unwrap_or(""),
                root.tag_name().name()
            )));
        }
    };
    if root.tag_name().name() != "schema" {
        return Err(SchemaError::Malformed(format!(
            "root element must be 'schema', found '{}'",
            root.tag_name().name()
        )));
    }

    let document = SchemaReader { dialect }.schema(root)?;
    debug!(
        dialect = ?dialect,
        patterns = document.patterns.len(),
        phases = document.phases.len(),
        "parsed schema"
    );
    Ok(document)
}

struct SchemaReader {
    dialect: Dialect,
}

fn malformed(message: impl Into<String>) -> SchemaError {
    SchemaError::Malformed(message.into())
}

fn required<'a>(node: Node<'a, '_>, attribute: &str) -> SchemaResult<&'a str> {
    node.attribute(attribute).ok_or_else(|| {
        malformed(format!(
            "<{}> is missing required attribute '{}'",
            node.tag_name().name(),
            attribute
        ))
    })
}

fn is_true(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some("true") | Some("1"))
}

fn optional(node: Node<'_, '_>, attribute: &str) -> Option<String> {
    node.attribute(attribute).map(str::to_string)
}

fn normalized_text(node: Node<'_, '_>) -> String {
    let text: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl SchemaReader {
    fn children<'a, 'input>(
        &self,
        node: Node<'a, 'input>,
    ) -> impl Iterator<Item = Node<'a, 'input>> + use<'a, 'input> {
        let namespace = self.dialect.namespace();
        node.children()
            .filter(move |child| child.is_element() && child.tag_name().namespace() == Some(namespace))
    }

    fn schema(&self, root: Node<'_, '_>) -> SchemaResult<SchematronDocument> {
        let mut document = SchematronDocument {
            id: optional(root, "id"),
            schema_version: optional(root, "schemaVersion"),
            query_binding: optional(root, "queryBinding"),
            default_phase: optional(root, "defaultPhase"),
            ..SchematronDocument::default()
        };

        for child in self.children(root) {
            match child.tag_name().name() {
                "title" => document.title = Some(normalized_text(child)),
                "ns" => document.namespaces.push(NamespaceDefinition {
                    prefix: required(child, "prefix")?.to_string(),
                    uri: required(child, "uri")?.to_string(),
                }),
                "let" => document.lets.push(self.let_binding(child)?),
                "phase" => {
                    let phase = self.phase(child)?;
                    document.phases.insert(phase.id.clone(), phase);
                }
                "pattern" => document.patterns.push(self.pattern(child)?),
                "diagnostics" => {
                    for diagnostic in self
                        .children(child)
                        .filter(|n| n.tag_name().name() == "diagnostic")
                    {
                        let id = required(diagnostic, "id")?.to_string();
                        document.diagnostics.insert(
                            id.clone(),
                            Diagnostic {
                                id,
                                message: self.message(diagnostic),
                            },
                        );
                    }
                }
                "p" => {}
                other => warn!(element = other, "skipping unsupported schema element"),
            }
        }

        Ok(document)
    }

    fn let_binding(&self, node: Node<'_, '_>) -> SchemaResult<Let> {
        Ok(Let::new(required(node, "name")?, required(node, "value")?))
    }

    fn phase(&self, node: Node<'_, '_>) -> SchemaResult<Phase> {
        let mut phase = Phase {
            id: required(node, "id")?.to_string(),
            ..Phase::default()
        };
        for child in self.children(node) {
            match child.tag_name().name() {
                "active" => phase
                    .active_patterns
                    .push(required(child, "pattern")?.to_string()),
                "let" => phase.lets.push(self.let_binding(child)?),
                "p" => {}
                other => warn!(element = other, phase = %phase.id, "skipping unsupported phase element"),
            }
        }
        Ok(phase)
    }

    fn pattern(&self, node: Node<'_, '_>) -> SchemaResult<Pattern> {
        let mut pattern = Pattern {
            id: optional(node, "id"),
            is_abstract: is_true(node.attribute("abstract")),
            base_pattern_id: optional(node, "is-a"),
            // Schematron 1.5 titles patterns with @name.
            title: optional(node, "name"),
            ..Pattern::default()
        };

        for child in self.children(node) {
            match child.tag_name().name() {
                "title" => pattern.title = Some(normalized_text(child)),
                "param" => {
                    let name = required(child, "name")?.to_string();
                    let value = required(child, "value")?.to_string();
                    pattern.parameters.insert(name, value);
                }
                "let" => pattern.lets.push(self.let_binding(child)?),
                "rule" => pattern.rules.push(self.rule(child)?),
                "p" => {}
                other => warn!(element = other, "skipping unsupported pattern element"),
            }
        }

        if pattern.is_abstract && pattern.id.is_none() {
            return Err(malformed("abstract <pattern> requires an id"));
        }
        if pattern.base_pattern_id.is_some() && !pattern.rules.is_empty() {
            return Err(malformed(format!(
                "pattern '{}' instantiates an abstract pattern and may not declare rules",
                pattern.id_or_default()
            )));
        }
        Ok(pattern)
    }

    fn rule(&self, node: Node<'_, '_>) -> SchemaResult<Rule> {
        let is_abstract = is_true(node.attribute("abstract"));
        let context = match (node.attribute("context"), is_abstract) {
            (Some(context), _) => context.to_string(),
            (None, true) => String::new(),
            (None, false) => return Err(malformed("concrete <rule> requires a context")),
        };
        let mut rule = Rule {
            id: optional(node, "id"),
            is_abstract,
            ..Rule::new(context)
        };
        if rule.is_abstract && rule.id.is_none() {
            return Err(malformed("abstract <rule> requires an id"));
        }

        for child in self.children(node) {
            match child.tag_name().name() {
                "let" => rule.lets.push(self.let_binding(child)?),
                "extends" => rule.extends.push(required(child, "rule")?.to_string()),
                "assert" => rule
                    .assertions
                    .push(self.assertion(child, AssertionKind::Assert)?),
                "report" => rule
                    .assertions
                    .push(self.assertion(child, AssertionKind::Report)?),
                "p" => {}
                other => warn!(element = other, "skipping unsupported rule element"),
            }
        }
        Ok(rule)
    }

    fn assertion(&self, node: Node<'_, '_>, kind: AssertionKind) -> SchemaResult<Assertion> {
        Ok(Assertion {
            id: optional(node, "id"),
            kind,
            test: QuerySlot::new(required(node, "test")?),
            message: self.message(node),
            diagnostics: node
                .attribute("diagnostics")
                .map(|ids| ids.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            role: optional(node, "role"),
            flag: optional(node, "flag"),
            subject: optional(node, "subject"),
            icon: optional(node, "icon"),
        })
    }

    fn message(&self, node: Node<'_, '_>) -> Message {
        let mut message = Message::default();
        self.message_parts(node, &mut message.parts);
        message
    }

    fn message_parts(&self, node: Node<'_, '_>, parts: &mut Vec<MessagePart>) {
        for child in node.children() {
            if let Some(text) = child.text().filter(|_| child.is_text()) {
                parts.push(MessagePart::Text(text.to_string()));
                continue;
            }
            if !child.is_element() {
                continue;
            }
            let is_schematron = child.tag_name().namespace() == Some(self.dialect.namespace());
            match child.tag_name().name() {
                "value-of" if is_schematron => {
                    if let Some(select) = child.attribute("select") {
                        parts.push(MessagePart::ValueOf(QuerySlot::new(select)));
                    }
                }
                "name" if is_schematron => {
                    let path = child.attribute("path").unwrap_or(".");
                    parts.push(MessagePart::Name(QuerySlot::new(format!("name({})", path))));
                }
                _ => self.message_parts(child, parts),
            }
        }
    }
}
