// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependency declarations, resolution and ordering helpers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use super::node::ServiceNode;
use crate::error::{Error, Result};

/// A dependency as declared when assembling the tree.
#[derive(Clone)]
pub enum Dep {
    /// Sibling looked up by name at first start.
    Name(String),
    /// Node supplied directly, sibling or not.
    Node(Arc<ServiceNode>),
}

impl From<&str> for Dep {
    fn from(name: &str) -> Self {
        Dep::Name(name.to_string())
    }
}

impl From<String> for Dep {
    fn from(name: String) -> Self {
        Dep::Name(name)
    }
}

impl From<Arc<ServiceNode>> for Dep {
    fn from(node: Arc<ServiceNode>) -> Self {
        Dep::Node(node)
    }
}

impl From<&Arc<ServiceNode>> for Dep {
    fn from(node: &Arc<ServiceNode>) -> Self {
        Dep::Node(node.clone())
    }
}

/// A dependency as stored on a node. Never an ownership edge.
#[derive(Debug, Clone)]
pub(crate) enum Dependency {
    Unresolved(String),
    Resolved { name: String, node: Weak<ServiceNode> },
}

impl Dependency {
    pub(crate) fn name(&self) -> &str {
        match self {
            Dependency::Unresolved(name) => name,
            Dependency::Resolved { name, .. } => name,
        }
    }
}

impl From<Dep> for Dependency {
    fn from(dep: Dep) -> Self {
        match dep {
            Dep::Name(name) => Dependency::Unresolved(name),
            Dep::Node(node) => Dependency::Resolved {
                name: node.name().to_string(),
                node: Arc::downgrade(&node),
            },
        }
    }
}

/// Depth-first search for a dependency cycle reachable from `start`.
///
/// Returns the names on the cycle with the first one repeated at the end.
pub(crate) fn find_cycle(start: &Arc<ServiceNode>) -> Result<Option<Vec<String>>> {
    let mut path: Vec<Arc<ServiceNode>> = Vec::new();
    let mut done: Vec<Arc<ServiceNode>> = Vec::new();
    visit(start, &mut path, &mut done)
}

fn visit(
    node: &Arc<ServiceNode>,
    path: &mut Vec<Arc<ServiceNode>>,
    done: &mut Vec<Arc<ServiceNode>>,
) -> Result<Option<Vec<String>>> {
    if let Some(index) = path.iter().position(|n| Arc::ptr_eq(n, node)) {
        let mut cycle: Vec<String> = path[index..].iter().map(|n| n.name().to_string()).collect();
        cycle.push(node.name().to_string());
        return Ok(Some(cycle));
    }
    if done.iter().any(|n| Arc::ptr_eq(n, node)) {
        return Ok(None);
    }

    path.push(node.clone());
    for dep in node.resolve_dependencies()? {
        if let Some(cycle) = visit(&dep, path, done)? {
            return Ok(Some(cycle));
        }
    }
    path.pop();
    done.push(node.clone());
    Ok(None)
}

/// Group children into stop layers: dependents come before the siblings they
/// depend on, and nodes within a layer are independent of each other.
///
/// Unresolvable or cyclic declarations never fail here; stopping is best
/// effort and every child lands in some layer.
pub(crate) fn stop_layers(children: &[Arc<ServiceNode>]) -> Vec<Vec<Arc<ServiceNode>>> {
    let index: HashMap<*const ServiceNode, usize> = children
        .iter()
        .enumerate()
        .map(|(i, c)| (Arc::as_ptr(c), i))
        .collect();

    let sibling_deps: Vec<Vec<usize>> = children
        .iter()
        .map(|c| {
            c.resolve_dependencies()
                .unwrap_or_default()
                .iter()
                .filter_map(|d| index.get(&Arc::as_ptr(d)).copied())
                .collect()
        })
        .collect();

    // Start depth: 0 for children without sibling deps, 1 + deepest dep
    // otherwise. Bounded relaxation so a cycle cannot loop forever.
    let mut depth = vec![0usize; children.len()];
    for _ in 0..children.len() {
        let mut changed = false;
        for (i, deps) in sibling_deps.iter().enumerate() {
            let wanted = deps.iter().map(|&d| depth[d] + 1).max().unwrap_or(0);
            if wanted > depth[i] && wanted <= children.len() {
                depth[i] = wanted;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let deepest = depth.iter().copied().max().unwrap_or(0);
    let mut layers: Vec<Vec<Arc<ServiceNode>>> = vec![Vec::new(); deepest + 1];
    for (child, d) in children.iter().zip(depth) {
        layers[deepest - d].push(child.clone());
    }
    layers.retain(|layer| !layer.is_empty());
    layers
}

pub(crate) fn unresolved(service: &str, dependency: &str) -> Error {
    Error::UnresolvedDependency {
        service: service.to_string(),
        dependency: dependency.to_string(),
    }
}
