//! Dependency ordering for service boot and shutdown.
//!
//! Produces groups of service types. Within a group, dependencies come before
//! their dependents: start walks a group front-to-back, stop walks it
//! back-to-front.

use std::collections::{BTreeMap, HashSet};

use crate::types::{Error, Result};

/// Service type -> directly depended-on types. Missing entries have no deps.
pub type DependencyMap = BTreeMap<String, Vec<String>>;

/// Partition `dependencies` into topologically ordered groups.
///
/// Each top-level traversal from an unvisited root yields one group. Fails
/// with [`Error::CircularDependency`] naming the node reached while it was
/// still being visited.
pub fn build_dependency(dependencies: &DependencyMap) -> Result<Vec<Vec<String>>> {
    let mut groups = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut visiting: HashSet<&str> = HashSet::new();

    for root in dependencies.keys() {
        let root = root.as_str();
        if visited.contains(root) {
            continue;
        }

        let mut group = Vec::new();
        // (node, index of next child to visit)
        let mut work: Vec<(&str, usize)> = vec![(root, 0)];
        visiting.insert(root);

        while let Some(frame) = work.last_mut() {
            let node = frame.0;
            let children = dependencies
                .get(node)
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            if frame.1 < children.len() {
                let child = children[frame.1].as_str();
                frame.1 += 1;

                if visiting.contains(child) {
                    return Err(Error::CircularDependency(child.to_string()));
                }
                if !visited.contains(child) {
                    visiting.insert(child);
                    work.push((child, 0));
                }
            } else {
                visiting.remove(node);
                visited.insert(node);
                group.push(node.to_string());
                work.pop();
            }
        }

        groups.push(group);
    }

    Ok(groups)
}
