//! Per-run evaluation state: variable scopes, the evaluator's compiled
//! expressions, and cached rule context selections.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use sxd_xpath::nodeset::Node;
use sxd_xpath::{Context, Factory, Value, XPath};
use tracing::trace;

use super::functions::{self, Current};
use super::node::NodeAddress;
use super::{CompiledQuery, QueryLanguage};
use crate::error::{EvalResult, EvaluationError, Result, ScopeError};
use crate::schema::{Assertion, Let, NamespaceDefinition, QuerySlot, Rule};

enum BindingState<'d> {
    Pending,
    Evaluating,
    Ready(Value<'d>),
}

struct Binding<'d> {
    name: String,
    query: Arc<CompiledQuery>,
    node: Node<'d>,
    state: BindingState<'d>,
}

/// Bindings visible from a point in the scope stack: everything in scopes
/// below `scope`, and the first `binding` entries of `scope` itself.
#[derive(Debug, Clone, Copy)]
struct Horizon {
    scope: usize,
    binding: usize,
}

pub struct MatchContext<'d> {
    language: QueryLanguage,
    namespaces: Vec<NamespaceDefinition>,
    root: Node<'d>,
    scopes: Vec<Vec<Binding<'d>>>,
    xpaths: HashMap<String, Rc<XPath>>,
    selections: HashMap<String, Rc<HashSet<Node<'d>>>>,
}

impl<'d> MatchContext<'d> {
    pub fn new(language: QueryLanguage, namespaces: Vec<NamespaceDefinition>, root: Node<'d>) -> Self {
        Self {
            language,
            namespaces,
            root,
            scopes: Vec::new(),
            xpaths: HashMap::new(),
            selections: HashMap::new(),
        }
    }

    pub fn language(&self) -> QueryLanguage {
        self.language
    }

    pub fn root(&self) -> Node<'d> {
        self.root
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    pub fn pop_scope(&mut self) -> std::result::Result<(), ScopeError> {
        self.scopes.pop().map(|_| ()).ok_or(ScopeError::Underflow)
    }

    /// Bind a `let` in the innermost scope. The value is evaluated relative
    /// to `node` the first time it is referenced.
    pub fn bind(&mut self, binding: &Let, node: Node<'d>) -> Result<()> {
        let language = self.language;
        let query = binding.value.get_or_compile(|source| language.compile(source))?;
        let scope = self.scopes.last_mut().ok_or(ScopeError::Underflow)?;
        if scope.iter().any(|b| b.name == binding.name) {
            return Err(ScopeError::DuplicateBinding {
                name: binding.name.clone(),
            }
            .into());
        }
        scope.push(Binding {
            name: binding.name.clone(),
            query,
            node,
            state: BindingState::Pending,
        });
        Ok(())
    }

    /// Whether a rule's context matches `node`.
    pub fn matches(&mut self, rule: &Rule, node: Node<'d>) -> EvalResult<bool> {
        let language = self.language;
        let query = rule
            .context
            .get_or_compile(|source| language.compile_pattern(source))?;

        if let Some(name) = &query.variable_ref {
            return Ok(match self.variable(name, self.horizon())? {
                Value::Nodeset(nodes) => nodes.document_order().contains(&node),
                _ => false,
            });
        }

        let selection = self.selection(&query)?;
        Ok(selection.contains(&node))
    }

    /// Evaluate an assertion's test on `node`; true means a diagnostic is
    /// due.
    pub fn assert(&mut self, assertion: &Assertion, node: Node<'d>) -> EvalResult<bool> {
        let value = self.evaluate(&assertion.test, node)?;
        Ok(assertion.kind.fires(value.boolean()))
    }

    /// Evaluate a slot on `node` and return the XPath string value.
    pub fn evaluate_string(&mut self, slot: &QuerySlot, node: Node<'d>) -> EvalResult<String> {
        Ok(self.evaluate(slot, node)?.string())
    }

    pub fn evaluate(&mut self, slot: &QuerySlot, node: Node<'d>) -> EvalResult<Value<'d>> {
        let language = self.language;
        let query = slot.get_or_compile(|source| language.compile(source))?;
        let horizon = self.horizon();
        self.evaluate_query(&query, node, horizon)
    }

    fn horizon(&self) -> Horizon {
        match self.scopes.len() {
            0 => Horizon {
                scope: 0,
                binding: 0,
            },
            n => Horizon {
                scope: n - 1,
                binding: self.scopes[n - 1].len(),
            },
        }
    }

    fn find(&self, name: &str, horizon: Horizon) -> Option<(usize, usize)> {
        if self.scopes.is_empty() {
            return None;
        }
        for scope in (0..=horizon.scope.min(self.scopes.len() - 1)).rev() {
            let limit = if scope == horizon.scope {
                horizon.binding.min(self.scopes[scope].len())
            } else {
                self.scopes[scope].len()
            };
            if let Some(index) = self.scopes[scope][..limit]
                .iter()
                .rposition(|b| b.name == name)
            {
                return Some((scope, index));
            }
        }
        None
    }

    fn variable(&mut self, name: &str, horizon: Horizon) -> EvalResult<Value<'d>> {
        let (scope, index) = self
            .find(name, horizon)
            .ok_or_else(|| EvaluationError::UnknownVariable(name.to_string()))?;

        let binding = &mut self.scopes[scope][index];
        match &binding.state {
            BindingState::Ready(value) => return Ok(value.clone()),
            BindingState::Evaluating => {
                return Err(EvaluationError::CircularVariable(name.to_string()));
            }
            BindingState::Pending => {}
        }
        binding.state = BindingState::Evaluating;
        let query = Arc::clone(&binding.query);
        let node = binding.node;

        // A binding sees only what was defined before it.
        let result = self.evaluate_query(
            &query,
            node,
            Horizon {
                scope,
                binding: index,
            },
        );

        let binding = &mut self.scopes[scope][index];
        match result {
            Ok(value) => {
                trace!(variable = name, "evaluated let binding");
                binding.state = BindingState::Ready(value.clone());
                Ok(value)
            }
            Err(err) => {
                binding.state = BindingState::Pending;
                Err(err)
            }
        }
    }

    fn xpath(&mut self, text: &str) -> EvalResult<Rc<XPath>> {
        if let Some(xpath) = self.xpaths.get(text) {
            return Ok(Rc::clone(xpath));
        }
        let xpath = Factory::new()
            .build(text)
            .map_err(|err| EvaluationError::Compile {
                expression: text.to_string(),
                details: err.to_string(),
            })?
            .ok_or_else(|| EvaluationError::Compile {
                expression: text.to_string(),
                details: "empty expression".to_string(),
            })?;
        let xpath = Rc::new(xpath);
        self.xpaths.insert(text.to_string(), Rc::clone(&xpath));
        Ok(xpath)
    }

    fn evaluate_query(
        &mut self,
        query: &CompiledQuery,
        node: Node<'d>,
        horizon: Horizon,
    ) -> EvalResult<Value<'d>> {
        let mut values = Vec::with_capacity(query.variables.len());
        for name in &query.variables {
            values.push((name.as_str(), self.variable(name, horizon)?));
        }

        let xpath = self.xpath(&query.text)?;
        let mut context = Context::new();
        for namespace in &self.namespaces {
            context.set_namespace(&namespace.prefix, &namespace.uri);
        }
        functions::register(&mut context, self.language);
        if query.uses_current {
            context.set_function("current", Current::new(NodeAddress::of(node)));
        }
        for (name, value) in values {
            context.set_variable(name, value);
        }

        xpath
            .evaluate(&context, node)
            .map_err(|err| EvaluationError::Execution {
                expression: query.source.clone(),
                details: err.to_string(),
            })
    }

    /// Nodes selected by an anchored rule context. Selections that do not
    /// depend on variables are computed once per run.
    fn selection(&mut self, query: &CompiledQuery) -> EvalResult<Rc<HashSet<Node<'d>>>> {
        let cacheable = query.variables.is_empty();
        if cacheable && let Some(selection) = self.selections.get(&query.text) {
            return Ok(Rc::clone(selection));
        }

        let root = self.root;
        let horizon = self.horizon();
        let selection: HashSet<Node<'d>> = match self.evaluate_query(query, root, horizon)? {
            Value::Nodeset(nodes) => nodes.document_order().into_iter().collect(),
            _ => {
                return Err(EvaluationError::Execution {
                    expression: query.source.clone(),
                    details: "rule context does not select nodes".to_string(),
                });
            }
        };
        let selection = Rc::new(selection);
        if cacheable {
            self.selections
                .insert(query.text.clone(), Rc::clone(&selection));
        }
        Ok(selection)
    }
}
