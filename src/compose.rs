//! HTML composition.
//!
//! After a visit completes, the guest harness hands back a snapshot of the
//! virtual document (title, head node, root element) as a plain tree. The
//! composer serializes the head and body fragments and, in discovery mode,
//! prepends the buffered discovery payloads ahead of the body markup.
//!
//! The composer serializes the *children* of the head node and of the root
//! element, never the container elements themselves: the base template
//! already supplies `<head>` and `<body>`, and serializing the container
//! would nest a second one inside it.
//!
//! Pure functions of their inputs; no host I/O.

use serde::Deserialize;

use crate::discovery::DiscoveryEvent;

/// Elements serialized without a closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// One node of the rendered virtual document, as snapshotted by the guest
/// harness.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Node {
    /// A text node.
    Text { text: String },
    /// An element with its attributes in set order and its children in
    /// document order.
    Element {
        tag: String,
        #[serde(default)]
        attrs: Vec<(String, String)>,
        #[serde(default)]
        children: Vec<Node>,
    },
}

/// The raw outcome of one guest visit, decoded from the harness snapshot.
#[derive(Debug, Deserialize)]
pub struct VisitOutcome {
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub head: Option<Node>,
    pub body: Node,
}

/// The composed output of one successful visit.
#[derive(Debug, Clone)]
pub struct RenderResult {
    /// The URL the guest application settled on (it may differ from the
    /// requested path after guest-side redirects).
    pub url: String,
    /// The document title set during the visit.
    pub title: String,
    /// Serialized contents of the document head.
    pub head_html: String,
    /// Discovery blocks (in capture order) followed by the serialized
    /// contents of the root element.
    pub body_html: String,
}

/// Compose the final render result from a visit outcome and that visit's
/// discovery events.
pub fn compose(outcome: VisitOutcome, events: &[DiscoveryEvent]) -> RenderResult {
    let head_html = outcome
        .head
        .as_ref()
        .map(serialize_children)
        .unwrap_or_default();

    let datalets: Vec<String> = events.iter().map(discovery_block).collect();
    let mut body_html = datalets.join("\n");
    body_html.push_str(&serialize_children(&outcome.body));

    RenderResult {
        url: outcome.url,
        title: outcome.title,
        head_html,
        body_html,
    }
}

/// Render one discovery event as a self-contained inline data block. The
/// payload is inlined verbatim; it is data for the client-side application,
/// not markup.
fn discovery_block(event: &DiscoveryEvent) -> String {
    format!(
        "<script class=\"resource-discovery-response\">{}</script>",
        event.payload
    )
}

/// Serialize the children of `node` in document order. Returns the empty
/// string for a text node or a childless element.
pub fn serialize_children(node: &Node) -> String {
    let mut out = String::new();
    if let Node::Element { children, .. } = node {
        for child in children {
            serialize_node(child, &mut out);
        }
    }
    out
}

fn serialize_node(node: &Node, out: &mut String) {
    match node {
        Node::Text { text } => out.push_str(&escape_text(text)),
        Node::Element {
            tag,
            attrs,
            children,
        } => {
            out.push('<');
            out.push_str(tag);
            for (name, value) in attrs {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                out.push_str(&escape_attribute(value));
                out.push('"');
            }
            out.push('>');

            if VOID_ELEMENTS.contains(&tag.as_str()) {
                return;
            }

            for child in children {
                serialize_node(child, out);
            }
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
    }
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}
