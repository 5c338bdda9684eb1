//! Helpers for extracting values from KDL nodes.

use crate::{ConfigError, ConfigResult};
use kdl::KdlNode;
use std::collections::BTreeMap;

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn required_string_arg(node: &KdlNode, what: &str) -> ConfigResult<String> {
    first_string_arg(node).ok_or_else(|| ConfigError::MissingField(what.to_string()))
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

pub(crate) fn u32_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u32::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: name.to_string(),
                message: format!("expected a non-negative integer, got {}", value),
            }),
    }
}

/// All values of a property that may be repeated (`after="a" after="b"`).
pub(crate) fn string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

/// Child nodes of the form `KEY "value"` collected into a map.
pub(crate) fn string_map(node: &KdlNode) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if let Some(value) = first_string_arg(child) {
                map.insert(child.name().value().to_string(), value);
            }
        }
    }
    map
}
