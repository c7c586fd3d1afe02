/*!
 * Reconstruction of nested objects from flattened property paths.
 *
 * The gateway publishes one message per JSON leaf, addressed by a
 * `/`-separated path. A numeric segment is an array index; the segment
 * before it names the array.
 */
use std::collections::BTreeMap;

use serde_json::Map;

use greennet_core::types::Value;

use crate::device::{DeviceError, Result};

/// Largest array index accepted from a path
pub const MAX_ARRAY_INDEX: usize = 1024;

/// A node of a partially built object
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Node {
    /// Placeholder for an array slot that has not been filled yet
    #[default]
    Unset,
    /// A parsed leaf
    Scalar(Value),
    /// An array container
    Array(Vec<Node>),
    /// An object container
    Object(BTreeMap<String, Node>),
}

fn index_of(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

impl Node {
    /// Empty object, the root of every tree
    pub fn object() -> Self {
        Node::Object(BTreeMap::new())
    }

    /// Whether the node holds nothing
    pub fn is_empty(&self) -> bool {
        match self {
            Node::Unset => true,
            Node::Scalar(_) => false,
            Node::Array(items) => items.iter().all(Node::is_empty),
            Node::Object(entries) => entries.is_empty(),
        }
    }

    /// Child of an object node
    pub fn get(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Object(entries) => entries.get(key),
            _ => None,
        }
    }

    /// Entries of an object node
    pub fn as_object(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Node::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// Take the entries of an object node
    pub fn into_object(self) -> Option<BTreeMap<String, Node>> {
        match self {
            Node::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// Merge one leaf into the tree.
    ///
    /// Empty segments are skipped, so `a//b` and `/a/b` address the same
    /// leaf as `a/b`. A leaf or placeholder standing where a container is
    /// needed is replaced by that container.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(DeviceError::invalid_path(path, "path is empty"));
        }
        if !matches!(self, Node::Object(_) | Node::Array(_)) {
            *self = container_for(segments[0]);
        }
        self.set_segments(path, &segments, value)
    }

    fn set_segments(&mut self, path: &str, segments: &[&str], value: Value) -> Result<()> {
        let (head, rest) = match segments.split_first() {
            Some(split) => split,
            None => return Err(DeviceError::invalid_path(path, "path is empty")),
        };

        let slot = self.child_mut(path, head)?;
        match rest.first() {
            None => {
                *slot = Node::Scalar(value);
                Ok(())
            }
            Some(next) => {
                if !matches!(slot, Node::Object(_) | Node::Array(_)) {
                    *slot = container_for(next);
                }
                slot.set_segments(path, rest, value)
            }
        }
    }

    fn child_mut(&mut self, path: &str, segment: &str) -> Result<&mut Node> {
        match self {
            Node::Object(entries) => Ok(entries.entry(segment.to_string()).or_default()),
            Node::Array(items) => {
                let index = index_of(segment).ok_or_else(|| {
                    DeviceError::invalid_path(path, format!("'{}' is not an array index", segment))
                })?;
                if index > MAX_ARRAY_INDEX {
                    return Err(DeviceError::invalid_path(
                        path,
                        format!("index {} exceeds {}", index, MAX_ARRAY_INDEX),
                    ));
                }
                if items.len() <= index {
                    items.resize(index + 1, Node::Unset);
                }
                Ok(&mut items[index])
            }
            Node::Scalar(_) | Node::Unset => Err(DeviceError::invalid_path(
                path,
                format!("'{}' has no container", segment),
            )),
        }
    }

    /// Merge another tree into this one. Leaves of `other` win; its unset
    /// slots never erase existing values.
    pub fn merge(&mut self, other: Node) {
        match (self, other) {
            (_, Node::Unset) => {}
            (Node::Object(mine), Node::Object(theirs)) => {
                for (key, node) in theirs {
                    mine.entry(key).or_default().merge(node);
                }
            }
            (Node::Array(mine), Node::Array(theirs)) => {
                if mine.len() < theirs.len() {
                    mine.resize(theirs.len(), Node::Unset);
                }
                for (slot, node) in mine.iter_mut().zip(theirs) {
                    slot.merge(node);
                }
            }
            (mine, theirs) => *mine = theirs,
        }
    }

    /// Convert into a JSON value. Unset slots become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Node::Unset => serde_json::Value::Null,
            Node::Scalar(value) => value.to_json(),
            Node::Array(items) => serde_json::Value::Array(items.iter().map(Node::to_json).collect()),
            Node::Object(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<_, _>>(),
            ),
        }
    }

    /// Build a tree from a JSON value. Strings are kept as text.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Array(items) => Node::Array(items.iter().map(Node::from_json).collect()),
            serde_json::Value::Object(entries) => Node::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Node::from_json(v)))
                    .collect(),
            ),
            leaf => Value::from_json(leaf).map_or(Node::Unset, Node::Scalar),
        }
    }
}

fn container_for(segment: &str) -> Node {
    if index_of(segment).is_some() {
        Node::Array(Vec::new())
    } else {
        Node::object()
    }
}

/// Flatten a JSON value into the `(path, text)` pairs the gateway would
/// publish for it. Nulls are skipped.
pub fn flatten(json: &serde_json::Value) -> Vec<(String, String)> {
    let mut leaves = Vec::new();
    flatten_into(json, String::new(), &mut leaves);
    leaves
}

fn flatten_into(json: &serde_json::Value, prefix: String, leaves: &mut Vec<(String, String)>) {
    let child = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", prefix, key)
        }
    };

    match json {
        serde_json::Value::Null => {}
        serde_json::Value::Object(entries) => {
            for (key, value) in entries {
                flatten_into(value, child(key), leaves);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, value) in items.iter().enumerate() {
                flatten_into(value, child(&i.to_string()), leaves);
            }
        }
        serde_json::Value::String(s) => leaves.push((prefix, s.clone())),
        other => leaves.push((prefix, other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(fragments: &[(&str, &str)]) -> Node {
        let mut tree = Node::object();
        for (path, raw) in fragments {
            tree.set(path, Value::parse(raw)).unwrap();
        }
        tree
    }

    #[test]
    fn test_nested_objects() {
        let tree = build(&[
            ("deviceId", "0123ABCD"),
            ("states/switch", "on"),
            ("states/channel", "0"),
        ]);

        assert_eq!(
            tree.to_json(),
            json!({"deviceId": "0123ABCD", "states": {"switch": "on", "channel": 0}})
        );
    }

    #[test]
    fn test_numeric_segment_makes_array() {
        let tree = build(&[("eeps/0/eep", "D2-01-12"), ("eeps/0/version", "2")]);
        assert_eq!(tree.to_json(), json!({"eeps": [{"eep": "D2-01-12", "version": 2}]}));
    }

    #[test]
    fn test_sparse_array_padded_with_unset() {
        let mut tree = build(&[("functions/2/key", "switch")]);
        assert_eq!(tree.to_json(), json!({"functions": [null, null, {"key": "switch"}]}));

        tree.set("functions/0/key", Value::parse("channel")).unwrap();
        tree.set("functions/0/value", Value::parse("1")).unwrap();
        assert_eq!(
            tree.to_json(),
            json!({"functions": [{"key": "channel", "value": 1}, null, {"key": "switch"}]})
        );
    }

    #[test]
    fn test_terminal_index_into_array() {
        let tree = build(&[("values/1", "b"), ("values/0", "a")]);
        assert_eq!(tree.to_json(), json!({"values": ["a", "b"]}));
    }

    #[test]
    fn test_empty_segments_skipped() {
        let tree = build(&[("/states//switch/", "off")]);
        assert_eq!(tree.to_json(), json!({"states": {"switch": "off"}}));
        assert!(Node::object().set("//", Value::from(1)).is_err());
    }

    #[test]
    fn test_invalid_paths() {
        let mut tree = build(&[("list/0", "x")]);
        assert!(matches!(
            tree.set("list/name", Value::from(1)),
            Err(DeviceError::InvalidPath { .. })
        ));
        assert!(tree.set("big/99999/x", Value::from(1)).is_err());
    }

    #[test]
    fn test_scalar_replaced_by_container() {
        let tree = build(&[("states", "pending"), ("states/switch", "on")]);
        assert_eq!(tree.to_json(), json!({"states": {"switch": "on"}}));
    }

    #[test]
    fn test_numeric_keys_in_object() {
        let tree = build(&[("01234567/deviceId", "x"), ("01234567/dbm", "-70")]);
        assert_eq!(tree.to_json(), json!({"01234567": {"deviceId": "x", "dbm": -70}}));
    }

    #[test]
    fn test_flatten_then_rebuild() {
        let original = json!({
            "deviceId": "0123ABCD",
            "friendlyId": "kitchen",
            "eeps": [{"eep": "D2-01-12", "direction": "from"}, {"eep": "A5-38-08"}],
            "dbm": -71,
            "telegramInfo": {"dbm": -65, "repeated": false},
            "functions": [
                {"key": "dimValue", "value": 55},
                {"key": "channel", "value": 1}
            ]
        });

        let leaves = flatten(&original);
        let forward = leaves.iter().map(|(p, v)| (p.as_str(), v.as_str())).collect::<Vec<_>>();
        assert_eq!(build(&forward).to_json(), original);

        let backward = forward.iter().rev().cloned().collect::<Vec<_>>();
        assert_eq!(build(&backward).to_json(), original);
    }

    #[test]
    fn test_merge() {
        let mut tree = build(&[("a/switch", "on"), ("list/1", "y")]);
        let other = Node::from_json(&json!({"a": {"dimValue": 10}, "list": ["x", null]}));
        tree.merge(other);

        assert_eq!(
            tree.to_json(),
            json!({"a": {"switch": "on", "dimValue": 10}, "list": ["x", "y"]})
        );
        assert!(Node::object().is_empty());
        assert!(!tree.is_empty());
    }
}
