//! Param templating and dependency DAG construction.
//!
//! Resolves `{{params.key}}` templates at declaration time. Builds a DAG over
//! the nodes of each stack (token references plus explicit depends_on) and
//! over the stacks themselves (references to another stack's outputs), and
//! computes topological orders using Kahn's algorithm with declaration-order
//! tie-breaking.

use super::token::{Expr, Token};
use super::types::*;
use crate::error::{Result, StrataError};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

// ============================================================================
// Param templates
// ============================================================================

/// Resolve all `{{params.key}}` templates in a string.
pub fn resolve_template(template: &str, params: &IndexMap<String, Value>) -> Result<String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..].find("}}").ok_or_else(|| {
            StrataError::Config(format!(
                "unclosed template at position {} in \"{}\"",
                open, template
            ))
        })?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = match key.strip_prefix("params.") {
            Some(param_key) => params
                .get(param_key)
                .map(super::token::value_to_text)
                .ok_or_else(|| StrataError::Config(format!("unknown param: {}", param_key)))?,
            None => {
                return Err(StrataError::Config(format!(
                    "unknown template variable: {}",
                    key
                )))
            }
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// Key of a string that is exactly one template, e.g. `"{{params.count}}"`.
fn whole_template_key(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    inner.trim().strip_prefix("params.")
}

/// Expand templates throughout a declared value.
///
/// A string that is exactly one template takes the parameter's value with
/// its type intact; anything else is rendered as text.
pub fn resolve_params(value: &Value, params: &IndexMap<String, Value>) -> Result<Value> {
    match value {
        Value::String(s) => {
            if let Some(key) = whole_template_key(s) {
                return params
                    .get(key)
                    .cloned()
                    .ok_or_else(|| StrataError::Config(format!("unknown param: {}", key)));
            }
            Ok(Value::String(resolve_template(s, params)?))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_params(v, params))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_params(v, params)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

// ============================================================================
// Dependency graph
// ============================================================================

/// Per-stack slice of the dependency graph.
#[derive(Debug, Clone, Default)]
pub struct StackGraph {
    /// Nodes in evaluation order
    pub order: Vec<String>,

    /// node -> in-stack producers it waits for
    pub deps: IndexMap<String, Vec<String>>,

    /// node -> in-stack consumers waiting for it
    pub dependents: IndexMap<String, Vec<String>>,

    /// Stacks whose outputs this stack consumes, in declaration order
    pub upstream: Vec<String>,

    /// Cross-stack tokens consumed, with the producing stack's output name
    pub cross_refs: Vec<(Token, String)>,
}

impl StackGraph {
    /// Every node that transitively consumes `node`.
    pub fn transitive_dependents(&self, node: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![node.to_string()];
        while let Some(current) = stack.pop() {
            for next in self.dependents.get(&current).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    stack.push(next.clone());
                }
            }
        }
        seen
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Stacks in evaluation order
    pub stack_order: Vec<String>,

    pub stacks: IndexMap<String, StackGraph>,

    /// token -> (producing stack, output name) for every bare-token output
    pub exports: HashMap<Token, (String, String)>,
}

impl DependencyGraph {
    /// Stacks that directly consume outputs of `stack`.
    pub fn downstream(&self, stack: &str) -> Vec<String> {
        self.stack_order
            .iter()
            .filter(|s| {
                self.stacks
                    .get(*s)
                    .is_some_and(|g| g.upstream.iter().any(|u| u == stack))
            })
            .cloned()
            .collect()
    }

    /// Every stack that transitively consumes outputs of `stack`.
    pub fn transitive_downstream(&self, stack: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut pending = vec![stack.to_string()];
        while let Some(current) = pending.pop() {
            for next in self.downstream(&current) {
                if seen.insert(next.clone()) {
                    pending.push(next);
                }
            }
        }
        seen
    }
}

/// Outputs that re-export a single token make that token visible to other stacks.
pub fn export_table(project: &Project) -> HashMap<Token, (String, String)> {
    let mut exports = HashMap::new();
    for (stack_name, stack) in &project.stacks {
        for (output_name, output) in &stack.outputs {
            if let Expr::Ref(token) = &output.expr {
                if token.stack == *stack_name {
                    exports
                        .entry(token.clone())
                        .or_insert_with(|| (stack_name.clone(), output_name.clone()));
                }
            }
        }
    }
    exports
}

/// Every token an input or output of `stack` mentions.
pub fn stack_tokens(stack: &StackSpec) -> impl Iterator<Item = &Token> {
    stack
        .nodes
        .values()
        .flat_map(|n| n.inputs.values())
        .chain(stack.outputs.values().map(|o| &o.expr))
        .flat_map(Expr::tokens)
}

/// Kahn's algorithm over `names`, picking the earliest-declared ready entry.
///
/// `deps[i]` lists indices that must precede `i`. On a cycle, returns the
/// names that could not be ordered.
pub fn topo_sort(names: &[String], deps: &[Vec<usize>]) -> std::result::Result<Vec<String>, Vec<String>> {
    let mut in_degree: Vec<usize> = vec![0; names.len()];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
    for (consumer, producers) in deps.iter().enumerate() {
        let unique: BTreeSet<usize> = producers.iter().copied().collect();
        for producer in unique {
            adjacency[producer].push(consumer);
            in_degree[consumer] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..names.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(names.len());
    while let Some(current) = ready.pop_first() {
        order.push(current);
        for &next in &adjacency[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != names.len() {
        let ordered: HashSet<usize> = order.into_iter().collect();
        return Err((0..names.len())
            .filter(|i| !ordered.contains(i))
            .map(|i| names[i].clone())
            .collect());
    }
    Ok(order.into_iter().map(|i| names[i].clone()).collect())
}

fn build_stack_graph(
    stack: &StackSpec,
    exports: &HashMap<Token, (String, String)>,
) -> Result<StackGraph> {
    let names: Vec<String> = stack.nodes.keys().cloned().collect();
    let index: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();

    let mut graph = StackGraph::default();
    let mut deps_idx: Vec<Vec<usize>> = Vec::with_capacity(names.len());

    for (address, node) in &stack.nodes {
        let mut producers: Vec<String> = Vec::new();
        let local_tokens = node
            .inputs
            .values()
            .flat_map(Expr::tokens)
            .filter(|t| t.stack == stack.name)
            .map(|t| &t.node);
        for producer in local_tokens.chain(node.depends_on.iter()) {
            if !index.contains_key(producer.as_str()) {
                return Err(StrataError::unresolved(
                    format!("{}.{}", stack.name, producer),
                    format!("node '{}' depends on unknown node", address),
                ));
            }
            if !producers.contains(producer) {
                producers.push(producer.clone());
            }
        }
        deps_idx.push(producers.iter().map(|p| index[p.as_str()]).collect());
        graph.deps.insert(address.clone(), producers);
        graph.dependents.insert(address.clone(), Vec::new());
    }
    for (consumer, producers) in &graph.deps {
        for producer in producers {
            if let Some(list) = graph.dependents.get_mut(producer) {
                list.push(consumer.clone());
            }
        }
    }

    graph.order = topo_sort(&names, &deps_idx).map_err(|members| {
        StrataError::CyclicDependency {
            members: members
                .into_iter()
                .map(|m| format!("{}.{}", stack.name, m))
                .collect(),
        }
    })?;

    for token in stack_tokens(stack).filter(|t| t.stack != stack.name) {
        let (producer, output) = exports.get(token).ok_or_else(|| {
            StrataError::unresolved(token, format!("not exported by stack '{}'", token.stack))
        })?;
        if !graph.upstream.contains(producer) {
            graph.upstream.push(producer.clone());
        }
        if !graph.cross_refs.iter().any(|(t, _)| t == token) {
            graph.cross_refs.push((token.clone(), output.clone()));
        }
    }

    Ok(graph)
}

/// Build the node and stack DAGs for a declared project.
pub fn build_graph(project: &Project) -> Result<DependencyGraph> {
    let exports = export_table(project);
    let mut stacks = IndexMap::new();
    for (name, stack) in &project.stacks {
        stacks.insert(name.clone(), build_stack_graph(stack, &exports)?);
    }

    let names: Vec<String> = project.stacks.keys().cloned().collect();
    let deps_idx: Vec<Vec<usize>> = names
        .iter()
        .map(|name| {
            stacks[name]
                .upstream
                .iter()
                .filter_map(|u| names.iter().position(|n| n == u))
                .collect()
        })
        .collect();
    let stack_order =
        topo_sort(&names, &deps_idx).map_err(|members| StrataError::CyclicDependency { members })?;

    Ok(DependencyGraph {
        stack_order,
        stacks,
        exports,
    })
}
