//! Immutable XML element trees.
//!
//! Stanzas and negotiation fragments are plain trees of [`Element`] and
//! text nodes. Values are immutable by convention: every "modify" helper
//! returns a new tree, so an element can be shared across interceptor
//! chains without defensive copying.

use std::fmt;

/// A child node: nested element or character data.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Node {
    /// A nested element.
    Element(Element),
    /// Character data (already unescaped).
    Text(String),
}

/// An XML element: qualified name, ordered attributes, ordered children.
///
/// Namespaces are kept as ordinary `xmlns` attributes; the routing core
/// only ever compares them as strings.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    /// An empty element with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Start building an element.
    pub fn builder(name: impl Into<String>) -> ElementBuilder {
        ElementBuilder {
            element: Element::new(name),
        }
    }

    /// The element name (including any prefix, e.g. `stream:features`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attribute lookup.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All attributes in document order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The `xmlns` attribute, if present.
    pub fn namespace(&self) -> Option<&str> {
        self.attr("xmlns")
    }

    /// All child nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements only.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children().find(|e| e.name == name)
    }

    /// First child element with the given name and `xmlns`.
    pub fn child_ns(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children()
            .find(|e| e.name == name && e.namespace() == Some(ns))
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// A copy with one attribute set (replacing any existing value).
    pub fn with_attr(&self, name: &str, value: &str) -> Element {
        let mut el = self.clone();
        match el.attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_owned(),
            None => el.attrs.push((name.to_owned(), value.to_owned())),
        }
        el
    }

    /// A copy with one attribute removed.
    pub fn without_attr(&self, name: &str) -> Element {
        let mut el = self.clone();
        el.attrs.retain(|(k, _)| k != name);
        el
    }

    /// A copy with an extra child element appended.
    pub fn with_child(&self, child: Element) -> Element {
        let mut el = self.clone();
        el.children.push(Node::Element(child));
        el
    }

    /// Serialize to wire form.
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(64);
        self.write_xml(&mut out);
        out
    }

    /// Serialize into an existing buffer.
    pub fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            escape_into(v, true, out);
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(e) => e.write_xml(out),
                Node::Text(t) => escape_into(t, false, out),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Render only the opening tag, unterminated children elided. Used for
    /// stream headers, which stay open for the stream's lifetime.
    pub fn write_open_tag(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            escape_into(v, true, out);
            out.push('"');
        }
        out.push('>');
    }

    pub(crate) fn push_attr(&mut self, name: String, value: String) {
        self.attrs.push((name, value));
    }

    pub(crate) fn push_node(&mut self, node: Node) {
        self.children.push(node);
    }
}

fn escape_into(s: &str, in_attr: bool, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if in_attr => out.push_str("&quot;"),
            '\'' if in_attr => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

/// Consuming builder for [`Element`].
#[derive(Debug)]
pub struct ElementBuilder {
    element: Element,
}

impl ElementBuilder {
    /// Add an attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.element.attrs.push((name.into(), value.into()));
        self
    }

    /// Add an attribute only when the value is present.
    pub fn attr_opt(self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.attr(name, v),
            None => self,
        }
    }

    /// Append a child element.
    pub fn child(mut self, child: Element) -> Self {
        self.element.children.push(Node::Element(child));
        self
    }

    /// Append several child elements.
    pub fn children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.element
            .children
            .extend(children.into_iter().map(Node::Element));
        self
    }

    /// Append character data.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.element.children.push(Node::Text(text.into()));
        self
    }

    /// Finish.
    pub fn build(self) -> Element {
        self.element
    }
}
