//! Plan generation: diff declared stacks against their state records.
//!
//! Planning never calls a provider. Inputs are resolved against recorded
//! outputs; a token whose producer is itself about to change is "known
//! after apply", so its consumer is planned as an update.

use super::resolver::{DependencyGraph, StackGraph};
use super::state;
use super::token::{Token, TokenLookup};
use super::types::*;
use crate::error::{Result, StrataError};
use crate::provenance::hasher;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Resolve `names` against the graph, in evaluation order. Empty means all.
pub fn select_stacks(graph: &DependencyGraph, names: &[String]) -> Result<Vec<String>> {
    for name in names {
        if !graph.stacks.contains_key(name) {
            return Err(StrataError::Config(format!("unknown stack '{}'", name)));
        }
    }
    Ok(graph
        .stack_order
        .iter()
        .filter(|s| names.is_empty() || names.contains(*s))
        .cloned()
        .collect())
}

/// Load every stack's record that exists.
pub fn load_records(project: &Project) -> Result<HashMap<String, StateRecord>> {
    let mut records = HashMap::new();
    for (name, stack) in &project.stacks {
        if let Some(record) = state::load_for(stack)? {
            records.insert(name.clone(), record);
        }
    }
    Ok(records)
}

/// Teardown order for one stack's recorded nodes: orphans first (reverse
/// record order), then declared nodes in reverse dependency order.
pub fn teardown_order(graph: Option<&StackGraph>, record: &StateRecord) -> Vec<String> {
    let declared: HashSet<&str> = graph
        .map(|g| g.order.iter().map(String::as_str).collect())
        .unwrap_or_default();
    let mut order: Vec<String> = record
        .resources
        .keys()
        .rev()
        .filter(|k| !declared.contains(k.as_str()))
        .cloned()
        .collect();
    if let Some(g) = graph {
        order.extend(
            g.order
                .iter()
                .rev()
                .filter(|n| record.resources.contains_key(*n))
                .cloned(),
        );
    }
    order
}

/// Resolves tokens from recorded outputs, refusing producers that will change.
struct RecordLookup<'a> {
    records: &'a HashMap<String, StateRecord>,
    exports: &'a HashMap<Token, (String, String)>,
    changing: &'a HashSet<(String, String)>,
    consumer: &'a str,
}

impl TokenLookup for RecordLookup<'_> {
    fn lookup(&self, token: &Token) -> Result<Value> {
        if self
            .changing
            .contains(&(token.stack.clone(), token.node.clone()))
        {
            return Err(StrataError::unresolved(token, "known after apply"));
        }
        let record = self
            .records
            .get(&token.stack)
            .ok_or_else(|| StrataError::unresolved(token, "stack has no state record"))?;

        if token.stack == self.consumer {
            return record
                .resources
                .get(&token.node)
                .filter(|r| r.status == ResourceStatus::Realized)
                .and_then(|r| r.outputs.get(&token.attribute))
                .cloned()
                .ok_or_else(|| StrataError::unresolved(token, "not realized"));
        }

        let (_, output) = self
            .exports
            .get(token)
            .ok_or_else(|| StrataError::unresolved(token, "not exported"))?;
        record
            .outputs
            .get(output)
            .and_then(OutputValue::as_available)
            .cloned()
            .ok_or_else(|| StrataError::unresolved(token, "output unavailable"))
    }
}

fn changed_inputs(desired: &Attributes, recorded: &Attributes) -> Vec<String> {
    let mut names: Vec<String> = desired
        .iter()
        .filter(|(k, v)| recorded.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    names.extend(
        recorded
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned(),
    );
    names
}

/// Decide one node's action against its record entry.
fn determine_action(
    node: &NodeSpec,
    entry: Option<&ResourceRecord>,
    lookup: &dyn TokenLookup,
) -> (PlanAction, String) {
    let address = &node.address;
    let Some(entry) = entry else {
        return (
            PlanAction::Create,
            format!("{}: create {}", address, node.kind),
        );
    };
    if entry.status == ResourceStatus::Failed {
        return (
            PlanAction::Update,
            format!("{}: retry (previously failed)", address),
        );
    }
    match node.resolve_inputs(lookup) {
        Ok(inputs) if hasher::hash_inputs(node.kind, &inputs) == entry.inputs_hash => {
            (PlanAction::NoOp, format!("{}: no changes", address))
        }
        Ok(inputs) => {
            let changed = changed_inputs(&inputs, &entry.inputs);
            let detail = if changed.is_empty() {
                "kind changed".to_string()
            } else {
                format!("inputs changed: {}", changed.join(", "))
            };
            (
                PlanAction::Update,
                format!("{}: update ({})", address, detail),
            )
        }
        Err(_) => (
            PlanAction::Update,
            format!("{}: update (inputs known after apply)", address),
        ),
    }
}

/// Generate an apply plan for `selection` (already in evaluation order).
pub fn plan_with_records(
    project: &Project,
    graph: &DependencyGraph,
    selection: &[String],
    records: &HashMap<String, StateRecord>,
) -> ExecutionPlan {
    let mut changes = Vec::new();
    let mut changing: HashSet<(String, String)> = HashSet::new();

    for stack_name in selection {
        let (Some(stack), Some(stack_graph)) =
            (project.stacks.get(stack_name), graph.stacks.get(stack_name))
        else {
            continue;
        };
        let record = records.get(stack_name);

        for address in &stack_graph.order {
            let Some(node) = stack.nodes.get(address) else {
                continue;
            };
            let lookup = RecordLookup {
                records,
                exports: &graph.exports,
                changing: &changing,
                consumer: stack_name,
            };
            let entry = record.and_then(|r| r.resources.get(address));
            let (action, description) = determine_action(node, entry, &lookup);
            if action != PlanAction::NoOp {
                changing.insert((stack_name.clone(), address.clone()));
            }
            changes.push(PlannedChange {
                stack: stack_name.clone(),
                address: address.clone(),
                kind: node.kind,
                action,
                description,
            });
        }

        if let Some(record) = record {
            for orphan in teardown_order(None, record)
                .into_iter()
                .filter(|a| !stack.nodes.contains_key(a))
            {
                let kind = record.resources[&orphan].kind;
                changes.push(PlannedChange {
                    stack: stack_name.clone(),
                    description: format!("{}: destroy (no longer declared)", orphan),
                    address: orphan,
                    kind,
                    action: PlanAction::Destroy,
                });
            }
        }
    }

    summarize(&project.name, selection, changes)
}

/// Generate a teardown plan: stacks in reverse order, nodes in teardown order.
pub fn plan_destroy_with_records(
    project: &Project,
    graph: &DependencyGraph,
    selection: &[String],
    records: &HashMap<String, StateRecord>,
) -> ExecutionPlan {
    let mut changes = Vec::new();
    for stack_name in selection.iter().rev() {
        let Some(record) = records.get(stack_name) else {
            continue;
        };
        for address in teardown_order(graph.stacks.get(stack_name), record) {
            let kind = record.resources[&address].kind;
            changes.push(PlannedChange {
                stack: stack_name.clone(),
                description: format!("{}: destroy {}", address, kind),
                address,
                kind,
                action: PlanAction::Destroy,
            });
        }
    }
    let order: Vec<String> = selection.iter().rev().cloned().collect();
    summarize(&project.name, &order, changes)
}

fn summarize(name: &str, stack_order: &[String], changes: Vec<PlannedChange>) -> ExecutionPlan {
    let count = |a: PlanAction| changes.iter().filter(|c| c.action == a).count() as u32;
    ExecutionPlan {
        name: name.to_string(),
        stack_order: stack_order.to_vec(),
        to_create: count(PlanAction::Create),
        to_update: count(PlanAction::Update),
        to_destroy: count(PlanAction::Destroy),
        unchanged: count(PlanAction::NoOp),
        changes,
    }
}

/// Load records and plan an apply.
pub fn plan(project: &Project, graph: &DependencyGraph, selection: &[String]) -> Result<ExecutionPlan> {
    let records = load_records(project)?;
    Ok(plan_with_records(project, graph, selection, &records))
}

/// Load records and plan a teardown.
pub fn plan_destroy(
    project: &Project,
    graph: &DependencyGraph,
    selection: &[String],
) -> Result<ExecutionPlan> {
    let records = load_records(project)?;
    Ok(plan_destroy_with_records(project, graph, selection, &records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{parser, resolver};
    use indexmap::IndexMap;
    use serde_json::json;

    const YAML: &str = r#"
version: "1.0"
name: samples
params: { region: us-east-1 }
stacks:
  network:
    resources:
      vpc: { kind: vpc, inputs: { cidr_block: 10.0.0.0/16 } }
    outputs:
      vpc_id: "${vpc.id}"
  infra:
    resources:
      sg: { kind: security_group, inputs: { vpc_id: "${network.vpc.id}" } }
      logs: { kind: log_group, inputs: { name: "/ecs/samples" } }
"#;

    fn setup(yaml: &str) -> (Project, DependencyGraph) {
        let project = parser::check(parser::parse_config(yaml).unwrap()).unwrap();
        let graph = resolver::build_graph(&project).unwrap();
        (project, graph)
    }

    fn entry(kind: ResourceKind, inputs: Attributes, outputs: Attributes) -> ResourceRecord {
        ResourceRecord {
            kind,
            status: ResourceStatus::Realized,
            inputs_hash: hasher::hash_inputs(kind, &inputs),
            inputs,
            outputs,
            applied_at: None,
            duration_seconds: None,
        }
    }

    fn record(stack: &str) -> StateRecord {
        StateRecord {
            schema: "1.0".to_string(),
            stack: stack.to_string(),
            region: "us-east-1".to_string(),
            serial: 1,
            generated_at: "2026-01-01T00:00:00Z".to_string(),
            generator: "strata".to_string(),
            resources: IndexMap::new(),
            outputs: IndexMap::new(),
        }
    }

    /// Records matching a fully applied YAML project.
    fn applied() -> HashMap<String, StateRecord> {
        use crate::resources::attrs;
        let mut network = record("network");
        network.resources.insert(
            "vpc".to_string(),
            entry(
                ResourceKind::Vpc,
                attrs([("cidr_block", json!("10.0.0.0/16"))]),
                attrs([("id", json!("vpc-001"))]),
            ),
        );
        network
            .outputs
            .insert("vpc_id".to_string(), OutputValue::Available(json!("vpc-001")));

        let mut infra = record("infra");
        infra.resources.insert(
            "sg".to_string(),
            entry(
                ResourceKind::SecurityGroup,
                attrs([("vpc_id", json!("vpc-001"))]),
                attrs([("id", json!("sg-1"))]),
            ),
        );
        infra.resources.insert(
            "logs".to_string(),
            entry(
                ResourceKind::LogGroup,
                attrs([("name", json!("/ecs/samples"))]),
                attrs([("id", json!("/ecs/samples"))]),
            ),
        );

        let mut records = HashMap::new();
        records.insert("network".to_string(), network);
        records.insert("infra".to_string(), infra);
        records
    }

    fn all(graph: &DependencyGraph) -> Vec<String> {
        select_stacks(graph, &[]).unwrap()
    }

    #[test]
    fn test_plan_all_create() {
        let (project, graph) = setup(YAML);
        let plan = plan_with_records(&project, &graph, &all(&graph), &HashMap::new());
        assert_eq!(plan.to_create, 3);
        assert_eq!(plan.unchanged, 0);
        assert_eq!(plan.stack_order, vec!["network", "infra"]);
        assert_eq!(plan.changes[0].description, "vpc: create vpc");
    }

    #[test]
    fn test_plan_all_unchanged() {
        let (project, graph) = setup(YAML);
        let plan = plan_with_records(&project, &graph, &all(&graph), &applied());
        assert_eq!(plan.unchanged, 3);
        assert_eq!(plan.to_create + plan.to_update + plan.to_destroy, 0);
    }

    #[test]
    fn test_plan_update_on_changed_literal() {
        let (project, graph) = setup(&YAML.replace("/ecs/samples", "/ecs/renamed"));
        let plan = plan_with_records(&project, &graph, &all(&graph), &applied());
        assert_eq!(plan.to_update, 1);
        let change = plan.changes.iter().find(|c| c.address == "logs").unwrap();
        assert_eq!(change.description, "logs: update (inputs changed: name)");
        assert_eq!(plan.unchanged, 2);
    }

    #[test]
    fn test_upstream_change_propagates_as_known_after_apply() {
        let (project, graph) = setup(&YAML.replace("10.0.0.0/16", "10.9.0.0/16"));
        let plan = plan_with_records(&project, &graph, &all(&graph), &applied());
        let sg = plan.changes.iter().find(|c| c.address == "sg").unwrap();
        assert_eq!(sg.action, PlanAction::Update);
        assert!(sg.description.contains("known after apply"));
        let logs = plan.changes.iter().find(|c| c.address == "logs").unwrap();
        assert_eq!(logs.action, PlanAction::NoOp);
    }

    #[test]
    fn test_failed_entry_gets_retried() {
        let (project, graph) = setup(YAML);
        let mut records = applied();
        records.get_mut("network").unwrap().resources["vpc"].status = ResourceStatus::Failed;
        let plan = plan_with_records(&project, &graph, &["network".to_string()], &records);
        assert_eq!(plan.to_update, 1);
        assert!(plan.changes[0].description.contains("retry"));
    }

    #[test]
    fn test_orphan_planned_for_destroy() {
        let (project, graph) = setup(YAML);
        let mut records = applied();
        let old = records["infra"].resources["logs"].clone();
        records
            .get_mut("infra")
            .unwrap()
            .resources
            .insert("old-logs".to_string(), old);
        let plan = plan_with_records(&project, &graph, &all(&graph), &records);
        assert_eq!(plan.to_destroy, 1);
        let last = plan.changes.last().unwrap();
        assert_eq!(last.address, "old-logs");
        assert_eq!(last.action, PlanAction::Destroy);
    }

    #[test]
    fn test_destroy_plan_reverse_order() {
        let (project, graph) = setup(YAML);
        let plan = plan_destroy_with_records(&project, &graph, &all(&graph), &applied());
        let order: Vec<String> = plan
            .changes
            .iter()
            .map(|c| format!("{}/{}", c.stack, c.address))
            .collect();
        assert_eq!(order, vec!["infra/logs", "infra/sg", "network/vpc"]);
        assert_eq!(plan.to_destroy, 3);
        assert_eq!(plan.stack_order, vec!["infra", "network"]);
    }

    #[test]
    fn test_teardown_order_orphans_first() {
        let (_, graph) = setup(YAML);
        let mut rec = applied().remove("infra").unwrap();
        let extra = rec.resources["sg"].clone();
        rec.resources.insert("orphan-a".to_string(), extra.clone());
        rec.resources.insert("orphan-b".to_string(), extra);
        let order = teardown_order(graph.stacks.get("infra"), &rec);
        assert_eq!(order, vec!["orphan-b", "orphan-a", "logs", "sg"]);
    }

    #[test]
    fn test_select_unknown_stack() {
        let (_, graph) = setup(YAML);
        assert!(select_stacks(&graph, &["nope".to_string()]).is_err());
        assert_eq!(
            select_stacks(&graph, &["infra".to_string()]).unwrap(),
            vec!["infra"]
        );
    }

    #[test]
    fn test_plan_loads_records_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = YAML.replace(
            "params: { region: us-east-1 }",
            &format!(
                "params: {{ region: us-east-1 }}\nbackend: {{ location: \"{}\" }}",
                dir.path().display()
            ),
        );
        let (project, graph) = setup(&yaml);
        let plan = plan(&project, &graph, &all(&graph)).unwrap();
        assert_eq!(plan.to_create, 3);
    }
}
