//! Read operations over the suite tree
//!
//! Both walks are depth-first, pre-order. A node without its own source
//! file inherits the nearest ancestor's, carried as an explicit traversal
//! parameter rather than a stored parent link.

use std::collections::BTreeMap;

use super::filter::escape_title;
use super::{path_match, Registry, SuiteNode};

/// Mapping from normalized source file to the fully-qualified titles of the
/// suites it defines, in traversal order
pub type FileMap = BTreeMap<String, Vec<String>>;

/// Build the file → suite-titles mapping for every tagged node
pub fn build_file_map(registry: &Registry) -> FileMap {
    let mut map = FileMap::new();
    for root in registry.roots() {
        collect_into_map(root, None, "", &mut map);
    }
    map
}

fn collect_into_map(node: &SuiteNode, inherited: Option<&str>, prefix: &str, map: &mut FileMap) {
    let resolved = node.source_file.as_deref().or(inherited);
    let full_title = qualify(prefix, &node.title);

    if let Some(file) = resolved {
        map.entry(path_match::normalize(file))
            .or_default()
            .push(full_title.clone());
    }

    for child in &node.children {
        collect_into_map(child, resolved, &full_title, map);
    }
}

/// Fully-qualified titles of every suite whose resolved file matches the
/// pattern, with regex metacharacters escaped for literal embedding
pub fn suites_for_file(registry: &Registry, pattern: &str) -> Vec<String> {
    let pattern = path_match::normalize(pattern);
    let mut titles = Vec::new();
    for root in registry.roots() {
        collect_matching(root, None, "", &pattern, &mut titles);
    }
    titles
}

fn collect_matching(
    node: &SuiteNode,
    inherited: Option<&str>,
    prefix: &str,
    pattern: &str,
    titles: &mut Vec<String>,
) {
    let resolved = node.source_file.as_deref().or(inherited);
    let full_title = qualify(prefix, &node.title);

    if let Some(file) = resolved {
        if path_match::matches(file, pattern) {
            titles.push(escape_title(&full_title));
        }
    }

    for child in &node.children {
        collect_matching(child, resolved, &full_title, pattern, titles);
    }
}

fn qualify(prefix: &str, title: &str) -> String {
    if prefix.is_empty() {
        title.to_string()
    } else {
        format!("{prefix} {title}")
    }
}
