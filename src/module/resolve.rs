//! Dependency resolution.
//!
//! Modules are nodes indexed by their position in the input; edges exist only
//! for dependencies present in the set. Dependencies on modules outside the
//! set are assumed to be provided by the booted kernel and are reported back
//! to the caller instead of failing the build.

use std::collections::HashMap;

use super::ModuleDescriptor;
use crate::error::{BuildError, BuildResult};

/// A dependency edge dropped because the target is not in the module set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalDependency {
    pub module: String,
    pub dependency: String,
}

/// Modules in an order where every module follows its in-set dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOrder {
    pub modules: Vec<ModuleDescriptor>,
    pub external: Vec<ExternalDependency>,
}

impl LoadOrder {
    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Stable topological sort.
///
/// Repeatedly emits the earliest module (in input order) whose in-set
/// dependencies have all been emitted, so a module only moves later when a
/// dependency forces it to.
pub fn resolve_load_order(modules: Vec<ModuleDescriptor>) -> BuildResult<LoadOrder> {
    let n = modules.len();
    let (deps, external) = {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(n);
        for (i, m) in modules.iter().enumerate() {
            if let Some(&prev) = index.get(m.name.as_str()) {
                return Err(BuildError::DuplicateModuleName {
                    name: m.name.clone(),
                    first: modules[prev].source_path.clone(),
                    second: m.source_path.clone(),
                });
            }
            index.insert(&m.name, i);
        }

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut external = Vec::new();
        for (i, m) in modules.iter().enumerate() {
            for dep in &m.dependencies {
                match index.get(dep.as_str()) {
                    Some(&j) => deps[i].push(j),
                    None => external.push(ExternalDependency {
                        module: m.name.clone(),
                        dependency: dep.clone(),
                    }),
                }
            }
        }
        (deps, external)
    };

    let mut emitted = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        let next = (0..n).find(|&i| !emitted[i] && deps[i].iter().all(|&j| emitted[j]));
        match next {
            Some(i) => {
                emitted[i] = true;
                order.push(i);
            }
            None => return Err(cycle_error(&modules, &deps, &emitted)),
        }
    }

    let mut slots: Vec<Option<ModuleDescriptor>> = modules.into_iter().map(Some).collect();
    let modules = order.into_iter().filter_map(|i| slots[i].take()).collect();
    Ok(LoadOrder { modules, external })
}

/// Build the error for a stuck sort.
///
/// Every unemitted module still waits on another unemitted module, so
/// following first-unemitted-dependency links from any of them must revisit
/// a node; the loop from that node's first visit is a real cycle.
fn cycle_error(modules: &[ModuleDescriptor], deps: &[Vec<usize>], emitted: &[bool]) -> BuildError {
    let blocked: Vec<String> = (0..modules.len())
        .filter(|&i| !emitted[i])
        .map(|i| modules[i].name.clone())
        .collect();

    let mut path: Vec<usize> = Vec::new();
    let mut current = (0..modules.len()).find(|&i| !emitted[i]);
    while let Some(node) = current {
        if let Some(pos) = path.iter().position(|&p| p == node) {
            let cycle = path[pos..].iter().map(|&i| modules[i].name.clone()).collect();
            return BuildError::CyclicDependency { cycle, blocked };
        }
        path.push(node);
        current = deps[node].iter().copied().find(|&j| !emitted[j]);
    }

    // Unreachable for a stuck sort; report what could not be ordered.
    BuildError::CyclicDependency {
        cycle: blocked.clone(),
        blocked,
    }
}
