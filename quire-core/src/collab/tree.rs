//! Conversion between [`Block`] lists and the XML tree stored in the CRDT.
//!
//! Every top-level child of the fragment is one block: the element tag is the
//! block type, the `id` attribute carries the block id, remaining attributes
//! are block attributes and the element's children hold the inline content.

use log::{debug, warn};
use serde_json::{json, Map, Number, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use yrs::types::text::YChange;
use yrs::types::Attrs;
use yrs::{
    Any, Out, ReadTxn, Text, TransactionMut, Xml, XmlElementPrelim, XmlElementRef, XmlFragment,
    XmlFragmentRef, XmlOut, XmlTextPrelim, XmlTextRef,
};

use crate::{Block, DocumentId};

pub(crate) const ID_ATTRIBUTE: &str = "id";

/// Outcome of writing one inline node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Written {
    Content,
    Empty,
    Invalid,
}

/// Insert `block` as a top-level element at `index`.
pub(crate) fn insert_block(
    fragment: &XmlFragmentRef,
    txn: &mut TransactionMut,
    index: u32,
    block: &Block,
) {
    let element = fragment.insert(txn, index, XmlElementPrelim::empty(block.block_type.as_str()));
    element.insert_attribute(txn, ID_ATTRIBUTE, block.id.clone());
    for (name, value) in &block.attributes {
        if name == ID_ATTRIBUTE {
            continue;
        }
        element.insert_attribute(txn, name.as_str(), json_to_any(value));
    }

    let wrote = match block.structured_content.as_array() {
        Some(nodes) => write_content(&element, txn, nodes, &block.id),
        None => false,
    };
    if !wrote && !block.text.is_empty() {
        element.push_back(txn, XmlTextPrelim::new(block.text.as_str()));
    }
}

/// Write `nodes` as children of `parent`. Adjacent text nodes share one
/// text child, their marks stored as formatting attributes on each run.
/// Returns whether any content was written.
fn write_content(
    parent: &XmlElementRef,
    txn: &mut TransactionMut,
    nodes: &[Value],
    block_id: &str,
) -> bool {
    let mut wrote = false;
    let mut run: Option<XmlTextRef> = None;
    for node in nodes {
        let written = match node.get("type").and_then(Value::as_str) {
            Some("text") => write_text(parent, txn, &mut run, node, block_id),
            Some(kind) => {
                run = None;
                write_element(parent, txn, kind, node, block_id)
            }
            None => Written::Invalid,
        };
        match written {
            Written::Content => wrote = true,
            Written::Empty => {}
            Written::Invalid => {
                warn!("Skipping invalid inline node in block {}: {}", block_id, node)
            }
        }
    }
    wrote
}

fn write_text(
    parent: &XmlElementRef,
    txn: &mut TransactionMut,
    run: &mut Option<XmlTextRef>,
    node: &Value,
    block_id: &str,
) -> Written {
    let Some(text) = node.get("text").and_then(Value::as_str) else {
        return Written::Invalid;
    };
    if text.is_empty() {
        return Written::Empty;
    }
    let attrs = marks_to_attrs(node.get("marks"), block_id);
    let target = run.get_or_insert_with(|| parent.push_back(txn, XmlTextPrelim::new("")));
    let end = target.len(txn);
    target.insert_with_attributes(txn, end, text, attrs);
    Written::Content
}

fn write_element(
    parent: &XmlElementRef,
    txn: &mut TransactionMut,
    kind: &str,
    node: &Value,
    block_id: &str,
) -> Written {
    let child = parent.push_back(txn, XmlElementPrelim::empty(kind));
    if let Some(attrs) = node.get("attrs").and_then(Value::as_object) {
        for (name, value) in attrs {
            child.insert_attribute(txn, name.as_str(), json_to_any(value));
        }
    }
    if let Some(content) = node.get("content").and_then(Value::as_array) {
        write_content(&child, txn, content, block_id);
    }
    Written::Content
}

/// Each mark becomes one formatting attribute keyed by its type. The value
/// is the mark's attrs object, empty when it has none.
fn marks_to_attrs(marks: Option<&Value>, block_id: &str) -> Attrs {
    let mut attrs = Attrs::new();
    let Some(marks) = marks.and_then(Value::as_array) else {
        return attrs;
    };
    for mark in marks {
        let Some(kind) = mark.get("type").and_then(Value::as_str) else {
            warn!("Skipping mark without type in block {}: {}", block_id, mark);
            continue;
        };
        let value = match mark.get("attrs") {
            Some(object @ Value::Object(_)) => json_to_any(object),
            _ => Any::Map(Arc::new(HashMap::new())),
        };
        attrs.insert(Arc::from(kind), value);
    }
    attrs
}

fn attrs_to_marks(attrs: &Attrs) -> Vec<Value> {
    let mut marks: Vec<(&Arc<str>, &Any)> = attrs.iter().collect();
    marks.sort_by(|a, b| a.0.cmp(b.0));
    marks
        .into_iter()
        .map(|(kind, value)| match any_to_json(value) {
            Value::Object(map) if !map.is_empty() => json!({ "type": &**kind, "attrs": map }),
            _ => json!({ "type": &**kind }),
        })
        .collect()
}

/// Read the fragment back as blocks in tree order.
///
/// Block ids are unique in the result. Concurrent inserts can leave two
/// elements carrying the same `id`; every copy after the first gets a
/// positional id instead.
pub(crate) fn read_blocks<T: ReadTxn>(
    fragment: &XmlFragmentRef,
    txn: &T,
    document_id: &DocumentId,
) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut seen = HashSet::new();
    for index in 0..fragment.len(txn) {
        match fragment.get(txn, index) {
            Some(XmlOut::Element(element)) => {
                let order = blocks.len() as u32;
                let mut block = read_block(&element, txn, document_id, order);
                if seen.contains(&block.id) {
                    let renamed = positional_id(&seen, document_id, order);
                    debug!(
                        "Duplicate block id {} in {} read as {}",
                        block.id, document_id, renamed
                    );
                    block.id = renamed;
                }
                seen.insert(block.id.clone());
                blocks.push(block);
            }
            Some(_) => debug!("Ignoring non-element node at {} in {}", index, document_id),
            None => {}
        }
    }
    blocks
}

fn positional_id(seen: &HashSet<String>, document_id: &DocumentId, order: u32) -> String {
    let base = format!("{}:{}", document_id, order);
    if !seen.contains(&base) {
        return base;
    }
    let next = (1u32..)
        .map(|n| format!("{}.{}", base, n))
        .find(|candidate| !seen.contains(candidate));
    next.unwrap_or(base)
}

fn read_block<T: ReadTxn>(
    element: &XmlElementRef,
    txn: &T,
    document_id: &DocumentId,
    order: u32,
) -> Block {
    let mut id = None;
    let mut attributes = Map::new();
    for (name, value) in element.attributes(txn) {
        let value = out_to_json(value, txn);
        if name == ID_ATTRIBUTE {
            id = value.as_str().map(str::to_string);
        } else {
            attributes.insert(name.to_string(), value);
        }
    }

    let mut text = String::new();
    let content = read_children(element, txn, &mut text);

    Block {
        id: id.unwrap_or_else(|| format!("{}:{}", document_id, order)),
        text,
        structured_content: Value::Array(content),
        block_type: element.tag().to_string(),
        order,
        attributes,
    }
}

fn read_children<T: ReadTxn>(parent: &XmlElementRef, txn: &T, text: &mut String) -> Vec<Value> {
    let mut nodes = Vec::new();
    for index in 0..parent.len(txn) {
        match parent.get(txn, index) {
            Some(XmlOut::Text(node)) => read_text(&node, txn, text, &mut nodes),
            Some(XmlOut::Element(child)) => {
                let mut node = Map::new();
                node.insert("type".to_string(), Value::String(child.tag().to_string()));

                let mut attrs = Map::new();
                for (name, value) in child.attributes(txn) {
                    attrs.insert(name.to_string(), out_to_json(value, txn));
                }
                if !attrs.is_empty() {
                    node.insert("attrs".to_string(), Value::Object(attrs));
                }

                let content = read_children(&child, txn, text);
                if !content.is_empty() {
                    node.insert("content".to_string(), Value::Array(content));
                }
                nodes.push(Value::Object(node));
            }
            _ => {}
        }
    }
    nodes
}

/// One text node per formatting run.
fn read_text<T: ReadTxn>(node: &XmlTextRef, txn: &T, text: &mut String, nodes: &mut Vec<Value>) {
    for chunk in node.diff(txn, YChange::identity) {
        let Out::Any(Any::String(content)) = chunk.insert else {
            continue;
        };
        if content.is_empty() {
            continue;
        }
        text.push_str(&content);
        let marks = chunk
            .attributes
            .map(|attrs| attrs_to_marks(&attrs))
            .unwrap_or_default();
        if marks.is_empty() {
            nodes.push(json!({ "type": "text", "text": &*content }));
        } else {
            nodes.push(json!({ "type": "text", "text": &*content, "marks": marks }));
        }
    }
}

fn out_to_json<T: ReadTxn>(value: Out, txn: &T) -> Value {
    match value {
        Out::Any(any) => any_to_json(&any),
        other => Value::String(other.to_string(txn)),
    }
}

fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => {
            if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                Value::from(*n as i64)
            } else {
                Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null)
            }
        }
        Any::BigInt(n) => Value::from(*n),
        Any::String(s) => Value::String(s.to_string()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => {
            let items: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(Arc::from(items))
        }
        Value::Object(entries) => {
            let map: HashMap<String, Any> = entries
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect();
            Any::Map(Arc::new(map))
        }
    }
}
