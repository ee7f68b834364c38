//! Instance tree helpers: traversal order, positional paths and node
//! addresses that survive outside the document's lifetime.

use sxd_xpath::nodeset::Node;

/// Every node the validator visits, in document order: the root, then each
/// element followed by its attributes and its content. Comments and
/// processing instructions are skipped.
pub fn document_order<'d>(root: Node<'d>) -> Vec<Node<'d>> {
    let mut nodes = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match node {
            Node::Root(_) => {
                nodes.push(node);
                stack.extend(node.children().into_iter().rev());
            }
            Node::Element(element) => {
                nodes.push(node);
                nodes.extend(element.attributes().into_iter().map(Node::Attribute));
                stack.extend(node.children().into_iter().rev());
            }
            Node::Text(_) => nodes.push(node),
            _ => {}
        }
    }
    nodes
}

/// Qualified name of an element or attribute as it would be written, using
/// the preferred prefix of its namespace.
pub fn qualified_name(node: Node<'_>) -> String {
    match node {
        Node::Element(element) => {
            let local = element.name().local_part();
            match element.preferred_prefix() {
                Some(prefix) if element.name().namespace_uri().is_some() => {
                    format!("{}:{}", prefix, local)
                }
                _ => local.to_string(),
            }
        }
        Node::Attribute(attribute) => {
            let local = attribute.name().local_part();
            match attribute.preferred_prefix() {
                Some(prefix) if attribute.name().namespace_uri().is_some() => {
                    format!("{}:{}", prefix, local)
                }
                _ => local.to_string(),
            }
        }
        _ => String::new(),
    }
}

/// Unique positional path of a node, e.g. `/doc/item[2]/@id`.
///
/// Element steps carry an index only when the parent has more than one
/// child element with the same name. Text nodes are always indexed.
pub fn positional_path(node: Node<'_>) -> String {
    let mut steps = Vec::new();
    let mut current = Some(node);

    while let Some(node) = current {
        match node {
            Node::Root(_) => break,
            Node::Element(element) => {
                let siblings: Vec<Node<'_>> = node
                    .parent()
                    .map(|parent| parent.children())
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|sibling| match sibling {
                        Node::Element(other) => other.name() == element.name(),
                        _ => false,
                    })
                    .collect();
                let name = qualified_name(node);
                if siblings.len() > 1 {
                    let index = siblings.iter().position(|s| *s == node).unwrap_or(0) + 1;
                    steps.push(format!("{}[{}]", name, index));
                } else {
                    steps.push(name);
                }
            }
            Node::Attribute(_) => steps.push(format!("@{}", qualified_name(node))),
            Node::Text(_) => {
                let index = node
                    .parent()
                    .map(|parent| parent.children())
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|sibling| matches!(sibling, Node::Text(_)))
                    .position(|sibling| sibling == node)
                    .unwrap_or(0)
                    + 1;
                steps.push(format!("text()[{}]", index));
            }
            Node::Comment(_) => steps.push("comment()".to_string()),
            Node::ProcessingInstruction(_) => steps.push("processing-instruction()".to_string()),
            Node::Namespace(_) => steps.push("namespace::*".to_string()),
        }
        current = node.parent();
    }

    if steps.is_empty() {
        return "/".to_string();
    }
    steps.reverse();
    format!("/{}", steps.join("/"))
}

/// Location of a node as child indices from the document root, plus an
/// attribute index for attribute nodes.
///
/// Extension functions must be `'static`, so they hold an address instead
/// of a borrowed node and resolve it against whatever node the evaluator
/// hands them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    path: Vec<usize>,
    attribute: Option<usize>,
}

impl NodeAddress {
    pub fn of(node: Node<'_>) -> Self {
        let mut path = Vec::new();
        let mut attribute = None;
        let mut current = node;

        if let Node::Attribute(attr) = node
            && let Some(Node::Element(owner)) = node.parent()
        {
            attribute = owner.attributes().iter().position(|a| *a == attr);
            current = Node::Element(owner);
        }

        while let Some(parent) = current.parent() {
            let index = parent
                .children()
                .iter()
                .position(|child| *child == current)
                .unwrap_or(0);
            path.push(index);
            current = parent;
        }
        path.reverse();

        Self { path, attribute }
    }

    /// Find the addressed node in the document that contains `anchor`.
    pub fn resolve<'d>(&self, anchor: Node<'d>) -> Option<Node<'d>> {
        let mut node = anchor;
        while let Some(parent) = node.parent() {
            node = parent;
        }
        for &index in &self.path {
            node = node.children().get(index).copied()?;
        }
        match (self.attribute, node) {
            (Some(index), Node::Element(element)) => {
                element.attributes().get(index).copied().map(Node::Attribute)
            }
            (Some(_), _) => None,
            (None, node) => Some(node),
        }
    }
}
