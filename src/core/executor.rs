//! Evaluation engine: apply and destroy.
//!
//! Stacks run one after another in evaluation order. Inside a stack, ready
//! nodes are dispatched onto a `JoinSet`, bounded by `policy.concurrency`.
//! A node becomes ready once every in-stack producer is realized, and its
//! inputs are resolved just before dispatch. Each provider completion is
//! persisted under the stack's lease before the next dispatch round.

use super::planner;
use super::resolver::{DependencyGraph, StackGraph};
use super::state::{self, StateLease};
use super::token::Token;
use super::types::*;
use crate::error::{ProviderError, Result, StrataError};
use crate::provenance::{eventlog, hasher};
use crate::provider::{DeprovisionRequest, ProvisionRequest, ResourceProvider};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{Id, JoinSet};
use tracing::{debug, error, info, warn};

/// Cooperative cancellation flag shared with in-flight tasks.
///
/// Cancelling stops new dispatches; calls already handed to the provider
/// run to completion and are recorded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Configuration for an apply or destroy run.
pub struct ApplyConfig<'a> {
    pub project: &'a Project,
    pub graph: &'a DependencyGraph,
    /// Stacks to run, in evaluation order
    pub stacks: &'a [String],
    pub provider: Arc<dyn ResourceProvider>,
    pub cancel: CancelToken,
}

impl<'a> ApplyConfig<'a> {
    fn stack(&self, name: &str) -> Result<(&'a StackSpec, &'a StackGraph)> {
        let spec = self.project.stacks.get(name);
        let graph = self.graph.stacks.get(name);
        match (spec, graph) {
            (Some(s), Some(g)) => Ok((s, g)),
            _ => Err(StrataError::Config(format!("unknown stack '{}'", name))),
        }
    }
}

/// Apply the selected stacks.
///
/// Build-time problems and state-store conflicts surface as `Err`; node
/// failures are reported per node in the returned [`RunReport`].
pub async fn apply(cfg: &ApplyConfig<'_>) -> Result<RunReport> {
    let run_id = eventlog::generate_run_id();
    info!(
        run_id = %run_id,
        provider = cfg.provider.name(),
        stacks = cfg.stacks.len(),
        "apply started"
    );

    let mut report = RunReport::default();
    let mut snapshots: HashMap<String, Arc<StateRecord>> = HashMap::new();
    let mut blocked: Vec<String> = Vec::new();

    for name in cfg.stacks {
        let (stack, graph) = cfg.stack(name)?;
        let declared = stack.nodes.values().map(|n| (n.address.clone(), n.kind));

        if cfg.cancel.is_cancelled() {
            report.stacks.push(blocked_report(name, declared, "run cancelled"));
            blocked.push(name.clone());
            continue;
        }

        if let Some(up) = graph.upstream.iter().find(|u| blocked.contains(*u)) {
            let reason = format!("upstream stack '{}' did not complete", up);
            warn!(stack = %name, %reason, "stack blocked");
            report.stacks.push(blocked_report(name, declared, &reason));
            blocked.push(name.clone());
            continue;
        }

        let inbound = match cross_stack_values(cfg, stack, graph, &mut snapshots) {
            Ok(values) => values,
            Err(e @ StrataError::OutputUnavailable { .. }) => {
                error!(stack = %name, error = %e, "stack blocked");
                report.stacks.push(blocked_report(name, declared, &e.to_string()));
                blocked.push(name.clone());
                continue;
            }
            Err(e) => return Err(e),
        };

        let (stack_report, record) = apply_stack(cfg, stack, graph, inbound, &run_id).await?;
        snapshots.insert(name.clone(), Arc::new(record));
        report.stacks.push(stack_report);
    }

    info!(
        run_id = %run_id,
        failed = report.failed(),
        skipped = report.skipped(),
        "apply finished"
    );
    Ok(report)
}

/// Destroy the selected stacks, consumers before producers.
pub async fn destroy(cfg: &ApplyConfig<'_>) -> Result<RunReport> {
    let records = planner::load_records(cfg.project)?;
    let live = |name: &str| records.get(name).is_some_and(|r| !r.resources.is_empty());

    for name in cfg.stacks {
        let mut consumers: Vec<String> = cfg.graph.transitive_downstream(name).into_iter().collect();
        consumers.sort();
        if let Some(consumer) = consumers
            .iter()
            .find(|c| !cfg.stacks.contains(*c) && live(c.as_str()))
        {
            return Err(StrataError::Config(format!(
                "stack '{}' consumes outputs of '{}' and still holds resources; destroy it first",
                consumer, name
            )));
        }
    }

    let run_id = eventlog::generate_run_id();
    info!(run_id = %run_id, stacks = cfg.stacks.len(), "destroy started");

    let mut remaining: HashMap<String, bool> = records
        .iter()
        .map(|(name, r)| (name.clone(), !r.resources.is_empty()))
        .collect();
    let mut report = RunReport::default();

    for name in cfg.stacks.iter().rev() {
        let (stack, graph) = cfg.stack(name)?;
        let recorded: Vec<(String, ResourceKind)> = records
            .get(name)
            .map(|r| {
                planner::teardown_order(Some(graph), r)
                    .into_iter()
                    .filter_map(|a| r.resources.get(&a).map(|e| (a, e.kind)))
                    .collect()
            })
            .unwrap_or_default();

        if cfg.cancel.is_cancelled() {
            report.stacks.push(blocked_report(name, recorded, "run cancelled"));
            continue;
        }

        let still_live = cfg
            .graph
            .downstream(name)
            .into_iter()
            .find(|d| remaining.get(d).copied().unwrap_or(false));
        if let Some(consumer) = still_live {
            let reason = format!("downstream stack '{}' still holds resources", consumer);
            warn!(stack = %name, %reason, "stack blocked");
            report.stacks.push(blocked_report(name, recorded, &reason));
            continue;
        }

        let (stack_report, left) = destroy_stack(cfg, stack, graph, &run_id).await?;
        remaining.insert(name.clone(), left > 0);
        report.stacks.push(stack_report);
    }

    Ok(report)
}

// ============================================================================
// Per-stack passes
// ============================================================================

#[tracing::instrument(skip_all, fields(stack = %stack.name))]
async fn apply_stack(
    cfg: &ApplyConfig<'_>,
    stack: &StackSpec,
    graph: &StackGraph,
    inbound: HashMap<Token, Value>,
    run_id: &str,
) -> Result<(StackReport, StateRecord)> {
    let start = Instant::now();
    let policy = &cfg.project.policy;
    let concurrency = policy.concurrency.max(1);

    let mut lease = state::lock(&stack.backend)?;
    let mut record = state::load_for(stack)?.unwrap_or_else(|| state::new_record(stack));
    let mut pass = StackPass::new(stack, Some(graph), policy, inbound);
    pass.events.emit(ProvenanceEvent::PassStarted {
        stack: stack.name.clone(),
        run_id: run_id.to_string(),
        action: "apply".to_string(),
        strata_version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let mut queue = ReadyQueue::new(graph);
    let mut tasks: JoinSet<NodeOutcome> = JoinSet::new();
    let mut in_flight: HashMap<Id, String> = HashMap::new();
    let mut dispatched: HashMap<String, (Attributes, String)> = HashMap::new();
    let mut halted: Option<String> = None;
    let mut write_error: Option<StrataError> = None;

    loop {
        while halted.is_none() && in_flight.len() < concurrency {
            if cfg.cancel.is_cancelled() {
                warn!("cancelled, no further nodes will be dispatched");
                halted = Some("run cancelled".to_string());
                break;
            }
            let Some(address) = queue.pop() else { break };
            let Some(node) = stack.nodes.get(&address) else { continue };

            pass.transition(&address, NodeStatus::Resolving);
            let inputs = match node.resolve_inputs(&pass.values) {
                Ok(inputs) => inputs,
                Err(e) => {
                    pass.fail(&address, e.to_string(), false);
                    if policy.failure == FailurePolicy::StopOnFirst {
                        halted = Some(format!("stopped after failure of '{}'", address));
                    }
                    continue;
                }
            };

            let hash = hasher::hash_inputs(node.kind, &inputs);
            let entry = record.resources.get(&address);
            if let Some(entry) =
                entry.filter(|e| e.status == ResourceStatus::Realized && e.inputs_hash == hash)
            {
                debug!(node = %address, "unchanged");
                let outputs = entry.outputs.clone();
                pass.transition(&address, NodeStatus::Realized);
                pass.actions.insert(address.clone(), PlanAction::NoOp);
                pass.realize(&address, &outputs);
                queue.complete(&address);
                continue;
            }

            let action = if entry.is_some() {
                PlanAction::Update
            } else {
                PlanAction::Create
            };
            let prior = entry.map(|e| e.outputs.clone()).filter(|o| !o.is_empty());

            pass.transition(&address, NodeStatus::Provisioning);
            pass.actions.insert(address.clone(), action);
            pass.events.emit(ProvenanceEvent::NodeStarted {
                stack: stack.name.clone(),
                node: address.clone(),
                action: action.to_string(),
            });
            info!(node = %address, kind = %node.kind, %action, "provisioning");

            let request = ProvisionRequest {
                stack: stack.name.clone(),
                region: stack.region.clone(),
                address: address.clone(),
                kind: node.kind,
                inputs: inputs.clone(),
                prior,
            };
            let provider = cfg.provider.clone();
            let cancel = cfg.cancel.clone();
            let retries = policy.retries;
            let backoff = Duration::from_millis(policy.retry_backoff_ms);
            let handle = tasks.spawn(async move {
                let started = Instant::now();
                let result = with_retry(retries, backoff, &cancel, &request.address, || {
                    provider.provision(&request)
                })
                .await;
                NodeOutcome {
                    result,
                    duration: started.elapsed().as_secs_f64(),
                }
            });
            in_flight.insert(handle.id(), address.clone());
            dispatched.insert(address, (inputs, hash));
        }

        let Some(joined) = tasks.join_next_with_id().await else {
            break;
        };
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => (
                e.id(),
                NodeOutcome {
                    result: Err(ProviderError::fatal(format!("provider task aborted: {}", e))),
                    duration: 0.0,
                },
            ),
        };
        let Some(address) = in_flight.remove(&id) else { continue };
        let Some((inputs, hash)) = dispatched.remove(&address) else { continue };
        let Some(node) = stack.nodes.get(&address) else { continue };

        match outcome.result {
            Ok(outputs) => {
                record.resources.insert(
                    address.clone(),
                    ResourceRecord {
                        kind: node.kind,
                        status: ResourceStatus::Realized,
                        inputs_hash: hash.clone(),
                        inputs,
                        outputs: outputs.clone(),
                        applied_at: Some(eventlog::now_iso8601()),
                        duration_seconds: Some(outcome.duration),
                    },
                );
                persist(&mut lease, &mut record, &mut write_error, &mut halted);

                info!(node = %address, duration = outcome.duration, "realized");
                pass.transition(&address, NodeStatus::Realized);
                pass.realize(&address, &outputs);
                pass.events.emit(ProvenanceEvent::NodeRealized {
                    stack: stack.name.clone(),
                    node: address.clone(),
                    duration_seconds: outcome.duration,
                    hash,
                });
                queue.complete(&address);
            }
            Err(err) => {
                let previous = record
                    .resources
                    .get(&address)
                    .map(|e| e.outputs.clone())
                    .unwrap_or_default();
                record.resources.insert(
                    address.clone(),
                    ResourceRecord {
                        kind: node.kind,
                        status: ResourceStatus::Failed,
                        inputs_hash: hash,
                        inputs,
                        outputs: previous,
                        applied_at: Some(eventlog::now_iso8601()),
                        duration_seconds: Some(outcome.duration),
                    },
                );
                persist(&mut lease, &mut record, &mut write_error, &mut halted);

                pass.fail(&address, err.message.clone(), err.retryable);
                if policy.failure == FailurePolicy::StopOnFirst && halted.is_none() {
                    error!(node = %address, "stopping after first failure");
                    halted = Some(format!("stopped after failure of '{}'", address));
                }
            }
        }
    }

    let reason = halted.clone().unwrap_or_else(|| "not reached".to_string());
    for address in &graph.order {
        if pass.status(address) == NodeStatus::Pending {
            pass.skip(address, &reason);
        }
    }
    if let Some(err) = write_error {
        return Err(err);
    }

    // Orphans: recorded, no longer declared.
    let mut orphans = Vec::new();
    if halted.is_none() {
        let undeclared: Vec<String> = planner::teardown_order(Some(graph), &record)
            .into_iter()
            .filter(|a| !stack.nodes.contains_key(a))
            .collect();
        for address in undeclared {
            let Some(kind) = record.resources.get(&address).map(|e| e.kind) else {
                continue;
            };
            deprovision_node(cfg, stack, &mut pass, &mut lease, &mut record, &address).await?;
            orphans.push((address, kind));
        }
    }

    let outputs = compute_outputs(stack, &pass.values);
    if record.outputs != outputs || record.region != stack.region {
        record.outputs = outputs.clone();
        record.region = stack.region.clone();
        state::save(&mut lease, &mut record)?;
    }
    drop(lease);

    let nodes = graph
        .order
        .iter()
        .filter_map(|a| stack.nodes.get(a).map(|n| pass.report(a, n.kind)))
        .chain(orphans.iter().map(|(a, kind)| pass.report(a, *kind)))
        .collect();
    let report = StackReport {
        stack: stack.name.clone(),
        nodes,
        outputs,
        blocked: None,
        total_duration: start.elapsed(),
    };
    pass.complete(&report, run_id);
    Ok((report, record))
}

/// Tear down one stack. Returns the report and how many entries remain.
#[tracing::instrument(skip_all, fields(stack = %stack.name))]
async fn destroy_stack(
    cfg: &ApplyConfig<'_>,
    stack: &StackSpec,
    graph: &StackGraph,
    run_id: &str,
) -> Result<(StackReport, usize)> {
    let start = Instant::now();
    let policy = &cfg.project.policy;
    let mut lease = state::lock(&stack.backend)?;
    let Some(mut record) = state::load_for(stack)? else {
        debug!("no state record, nothing to destroy");
        let report = StackReport {
            stack: stack.name.clone(),
            nodes: Vec::new(),
            outputs: Default::default(),
            blocked: None,
            total_duration: start.elapsed(),
        };
        return Ok((report, 0));
    };

    let mut pass = StackPass::new(stack, None, policy, HashMap::new());
    pass.events.emit(ProvenanceEvent::PassStarted {
        stack: stack.name.clone(),
        run_id: run_id.to_string(),
        action: "destroy".to_string(),
        strata_version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let mut halted: Option<String> = None;
    let mut nodes = Vec::new();
    for address in planner::teardown_order(Some(graph), &record) {
        let Some(kind) = record.resources.get(&address).map(|e| e.kind) else {
            continue;
        };
        nodes.push((address.clone(), kind));

        if halted.is_none() && cfg.cancel.is_cancelled() {
            halted = Some("run cancelled".to_string());
        }
        if let Some(reason) = &halted {
            pass.skip(&address, reason);
            continue;
        }

        let consumer = graph
            .dependents
            .get(&address)
            .into_iter()
            .flatten()
            .find(|d| record.resources.contains_key(*d));
        if let Some(consumer) = consumer {
            pass.skip(&address, &format!("consumer '{}' was not removed", consumer));
            continue;
        }

        let removed = deprovision_node(cfg, stack, &mut pass, &mut lease, &mut record, &address).await?;
        if !removed && policy.failure == FailurePolicy::StopOnFirst {
            halted = Some(format!("stopped after failure of '{}'", address));
        }
    }

    let outputs = prune_outputs(stack, &record);
    if record.outputs != outputs {
        record.outputs = outputs.clone();
        state::save(&mut lease, &mut record)?;
    }
    drop(lease);

    let report = StackReport {
        stack: stack.name.clone(),
        nodes: nodes.iter().map(|(a, kind)| pass.report(a, *kind)).collect(),
        outputs,
        blocked: None,
        total_duration: start.elapsed(),
    };
    pass.complete(&report, run_id);
    Ok((report, record.resources.len()))
}

/// Save the record unless an earlier save in this pass already failed.
/// The first failure halts dispatch; in-flight nodes still run to completion.
fn persist(
    lease: &mut StateLease,
    record: &mut StateRecord,
    write_error: &mut Option<StrataError>,
    halted: &mut Option<String>,
) {
    if write_error.is_some() {
        return;
    }
    if let Err(e) = state::save(lease, record) {
        error!(error = %e, "state write failed, waiting for in-flight nodes");
        halted.get_or_insert_with(|| format!("state write failed: {}", e));
        *write_error = Some(e);
    }
}

/// Deprovision one recorded node; the entry is removed only on success.
async fn deprovision_node(
    cfg: &ApplyConfig<'_>,
    stack: &StackSpec,
    pass: &mut StackPass<'_>,
    lease: &mut StateLease,
    record: &mut StateRecord,
    address: &str,
) -> Result<bool> {
    let Some(entry) = record.resources.get(address) else {
        return Ok(false);
    };
    let request = DeprovisionRequest {
        stack: stack.name.clone(),
        region: stack.region.clone(),
        address: address.to_string(),
        kind: entry.kind,
        outputs: entry.outputs.clone(),
    };

    pass.transition(address, NodeStatus::Provisioning);
    pass.actions.insert(address.to_string(), PlanAction::Destroy);
    pass.events.emit(ProvenanceEvent::NodeStarted {
        stack: stack.name.clone(),
        node: address.to_string(),
        action: PlanAction::Destroy.to_string(),
    });
    info!(node = %address, kind = %request.kind, "deprovisioning");

    let policy = &cfg.project.policy;
    let started = Instant::now();
    let result = with_retry(
        policy.retries,
        Duration::from_millis(policy.retry_backoff_ms),
        &cfg.cancel,
        address,
        || cfg.provider.deprovision(&request),
    )
    .await;
    let duration = started.elapsed().as_secs_f64();

    match result {
        Ok(()) => {
            record.resources.shift_remove(address);
            state::save(lease, record)?;
            info!(node = %address, duration, "destroyed");
            pass.transition(address, NodeStatus::Destroyed);
            pass.events.emit(ProvenanceEvent::NodeDestroyed {
                stack: stack.name.clone(),
                node: address.to_string(),
                duration_seconds: duration,
            });
            Ok(true)
        }
        Err(err) => {
            pass.fail(address, err.message.clone(), err.retryable);
            Ok(false)
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct NodeOutcome {
    result: std::result::Result<Attributes, ProviderError>,
    duration: f64,
}

/// Call the provider, retrying retryable errors with linear backoff.
async fn with_retry<T, F, Fut>(
    retries: u32,
    backoff: Duration,
    cancel: &CancelToken,
    address: &str,
    mut call: F,
) -> std::result::Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(e) if e.retryable && attempt < retries && !cancel.is_cancelled() => {
                attempt += 1;
                warn!(node = %address, attempt, error = %e, "retrying");
                tokio::time::sleep(retry_delay(backoff, attempt)).await;
            }
            other => return other,
        }
    }
}

/// Linear backoff, saturating instead of overflowing.
fn retry_delay(backoff: Duration, attempt: u32) -> Duration {
    backoff.saturating_mul(attempt)
}

/// Values of cross-stack tokens a stack consumes, from producer snapshots.
fn cross_stack_values(
    cfg: &ApplyConfig<'_>,
    stack: &StackSpec,
    graph: &StackGraph,
    snapshots: &mut HashMap<String, Arc<StateRecord>>,
) -> Result<HashMap<Token, Value>> {
    let mut values = HashMap::new();
    for (token, output) in &graph.cross_refs {
        let producer = &token.stack;
        let unavailable = || StrataError::OutputUnavailable {
            stack: producer.clone(),
            output: output.clone(),
            consumer: stack.name.clone(),
        };

        let snapshot = match snapshots.get(producer) {
            Some(s) => s.clone(),
            None => {
                let (spec, _) = cfg.stack(producer)?;
                let loaded = Arc::new(state::load_for(spec)?.ok_or_else(unavailable)?);
                snapshots.insert(producer.clone(), loaded.clone());
                loaded
            }
        };
        let value = snapshot
            .outputs
            .get(output)
            .and_then(OutputValue::as_available)
            .ok_or_else(unavailable)?;
        values.insert(token.clone(), value.clone());
    }
    Ok(values)
}

/// Resolve declared outputs; anything with an unrealized source is unavailable.
fn compute_outputs(stack: &StackSpec, values: &HashMap<Token, Value>) -> indexmap::IndexMap<String, OutputValue> {
    stack
        .outputs
        .iter()
        .map(|(name, spec)| {
            let value = match spec.expr.resolve(values) {
                Ok(v) => OutputValue::Available(v),
                Err(e) => {
                    debug!(output = %name, reason = %e, "output unavailable");
                    OutputValue::Unavailable
                }
            };
            (name.clone(), value)
        })
        .collect()
}

/// Outputs after teardown: those whose sources were removed become unavailable.
fn prune_outputs(stack: &StackSpec, record: &StateRecord) -> indexmap::IndexMap<String, OutputValue> {
    if record.resources.is_empty() {
        return Default::default();
    }
    record
        .outputs
        .iter()
        .map(|(name, value)| {
            let intact = stack.outputs.get(name).is_some_and(|spec| {
                spec.expr
                    .tokens()
                    .iter()
                    .all(|t| t.stack != stack.name || record.resources.contains_key(&t.node))
            });
            let value = if intact {
                value.clone()
            } else {
                OutputValue::Unavailable
            };
            (name.clone(), value)
        })
        .collect()
}

/// Report for a stack that never started; every node is skipped.
fn blocked_report(
    stack: &str,
    nodes: impl IntoIterator<Item = (String, ResourceKind)>,
    reason: &str,
) -> StackReport {
    StackReport {
        stack: stack.to_string(),
        nodes: nodes
            .into_iter()
            .map(|(address, kind)| NodeReport {
                address,
                kind,
                status: NodeStatus::Skipped,
                action: None,
                error: Some(reason.to_string()),
            })
            .collect(),
        outputs: Default::default(),
        blocked: Some(reason.to_string()),
        total_duration: Duration::ZERO,
    }
}

/// Ready nodes in evaluation order; ties go to declaration order.
struct ReadyQueue<'a> {
    graph: &'a StackGraph,
    position: HashMap<&'a str, usize>,
    waiting: HashMap<&'a str, usize>,
    ready: BTreeSet<usize>,
}

impl<'a> ReadyQueue<'a> {
    fn new(graph: &'a StackGraph) -> Self {
        let position: HashMap<&str, usize> = graph
            .order
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let waiting: HashMap<&str, usize> = graph
            .deps
            .iter()
            .map(|(n, d)| (n.as_str(), d.len()))
            .collect();
        let ready = graph
            .order
            .iter()
            .enumerate()
            .filter(|(_, n)| waiting.get(n.as_str()).copied().unwrap_or(0) == 0)
            .map(|(i, _)| i)
            .collect();
        Self {
            graph,
            position,
            waiting,
            ready,
        }
    }

    fn pop(&mut self) -> Option<String> {
        self.ready.pop_first().map(|i| self.graph.order[i].clone())
    }

    /// Mark `address` realized and release dependents that are now ready.
    fn complete(&mut self, address: &str) {
        let Some(dependents) = self.graph.dependents.get(address) else {
            return;
        };
        for d in dependents {
            if let Some(count) = self.waiting.get_mut(d.as_str()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    if let Some(&i) = self.position.get(d.as_str()) {
                        self.ready.insert(i);
                    }
                }
            }
        }
    }
}

/// Append-only event sink for one stack; write failures only warn.
struct EventSink {
    path: Option<PathBuf>,
}

impl EventSink {
    fn emit(&self, event: ProvenanceEvent) {
        if let Some(path) = &self.path {
            if let Err(e) = eventlog::append_event(path, event) {
                warn!(error = %e, "failed to append provenance event");
            }
        }
    }
}

/// Node statuses and values accumulated over one stack pass.
struct StackPass<'a> {
    stack: &'a StackSpec,
    graph: Option<&'a StackGraph>,
    events: EventSink,
    statuses: HashMap<String, NodeStatus>,
    actions: HashMap<String, PlanAction>,
    errors: HashMap<String, String>,
    values: HashMap<Token, Value>,
}

impl<'a> StackPass<'a> {
    fn new(
        stack: &'a StackSpec,
        graph: Option<&'a StackGraph>,
        policy: &Policy,
        values: HashMap<Token, Value>,
    ) -> Self {
        let path = policy
            .provenance
            .then(|| eventlog::event_log_path(&stack.backend.record_path()));
        Self {
            stack,
            graph,
            events: EventSink { path },
            statuses: HashMap::new(),
            actions: HashMap::new(),
            errors: HashMap::new(),
            values,
        }
    }

    fn status(&self, address: &str) -> NodeStatus {
        self.statuses
            .get(address)
            .copied()
            .unwrap_or(NodeStatus::Pending)
    }

    fn transition(&mut self, address: &str, next: NodeStatus) {
        let current = self.status(address);
        debug_assert!(
            current.can_become(next),
            "{}: illegal transition {} -> {}",
            address,
            current,
            next
        );
        self.statuses.insert(address.to_string(), next);
    }

    fn realize(&mut self, address: &str, outputs: &Attributes) {
        for (attribute, value) in outputs {
            self.values.insert(
                Token::new(&self.stack.name, address, attribute),
                value.clone(),
            );
        }
    }

    fn skip(&mut self, address: &str, reason: &str) {
        info!(node = %address, %reason, "skipped");
        self.transition(address, NodeStatus::Skipped);
        self.errors.insert(address.to_string(), reason.to_string());
        self.events.emit(ProvenanceEvent::NodeSkipped {
            stack: self.stack.name.clone(),
            node: address.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Mark `address` failed and skip every pending transitive dependent.
    fn fail(&mut self, address: &str, message: String, retryable: bool) {
        error!(node = %address, error = %message, retryable, "failed");
        self.transition(address, NodeStatus::Failed);
        self.events.emit(ProvenanceEvent::NodeFailed {
            stack: self.stack.name.clone(),
            node: address.to_string(),
            error: message.clone(),
            retryable,
        });
        self.errors.insert(address.to_string(), message);

        let Some(graph) = self.graph else { return };
        let affected = graph.transitive_dependents(address);
        let reason = format!("dependency '{}' failed", address);
        for dependent in graph.order.iter().filter(|n| affected.contains(*n)) {
            if self.status(dependent) == NodeStatus::Pending {
                self.skip(dependent, &reason);
            }
        }
    }

    fn report(&self, address: &str, kind: ResourceKind) -> NodeReport {
        NodeReport {
            address: address.to_string(),
            kind,
            status: self.status(address),
            action: self.actions.get(address).copied(),
            error: self.errors.get(address).cloned(),
        }
    }

    fn complete(&self, report: &StackReport, run_id: &str) {
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        self.events.emit(ProvenanceEvent::PassCompleted {
            stack: self.stack.name.clone(),
            run_id: run_id.to_string(),
            realized: count(report.changed()),
            unchanged: count(report.unchanged()),
            failed: count(report.count(NodeStatus::Failed)),
            skipped: count(report.count(NodeStatus::Skipped)),
            total_seconds: report.total_duration.as_secs_f64(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::token::Expr;
    use crate::core::{parser, resolver};
    use crate::provider::scripted::ScriptedProvider;
    use crate::resources::attrs;
    use serde_json::json;
    use std::path::Path;

    const YAML: &str = r#"
version: "1.0"
name: samples
params: { region: us-east-1 }
backend: { location: "STATE_DIR" }
stacks:
  network:
    resources:
      vpc: { kind: vpc, inputs: { cidr_block: 10.0.0.0/16 } }
    outputs:
      vpc_id: "${vpc.id}"
  infra:
    resources:
      sg: { kind: security_group, inputs: { vpc_id: "${network.vpc.id}" } }
      cluster:
        kind: ecs_cluster
        inputs:
          name: main
          tags: { vpc: "${network.vpc.id}" }
      logs: { kind: log_group, inputs: { name: /ecs/samples } }
    outputs:
      sg_id: "${sg.id}"
      cluster_name: "${cluster.name}"
  app:
    resources:
      logs: { kind: log_group, inputs: { name: "${infra.cluster.name}" } }
"#;

    const SOLO: &str = r#"
version: "1.0"
name: solo
params: { region: us-east-1 }
backend: { location: "STATE_DIR" }
stacks:
  solo:
    resources:
      vpc: { kind: vpc, inputs: { cidr_block: 10.0.0.0/16 } }
      sg: { kind: security_group, inputs: { vpc_id: "${vpc.id}" } }
      a: { kind: log_group, inputs: { name: a } }
      b: { kind: log_group, inputs: { name: b } }
      c: { kind: log_group, inputs: { name: c } }
      d: { kind: log_group, inputs: { name: d } }
"#;

    fn project(yaml: &str, dir: &Path) -> Project {
        let yaml = yaml.replace("STATE_DIR", &dir.display().to_string());
        parser::check(parser::parse_config(&yaml).unwrap()).unwrap()
    }

    async fn run(project: &Project, provider: &Arc<ScriptedProvider>) -> Result<RunReport> {
        run_with(project, provider, &[], CancelToken::new()).await
    }

    async fn run_with(
        project: &Project,
        provider: &Arc<ScriptedProvider>,
        selection: &[String],
        cancel: CancelToken,
    ) -> Result<RunReport> {
        let graph = resolver::build_graph(project)?;
        let stacks = planner::select_stacks(&graph, selection)?;
        let cfg = ApplyConfig {
            project,
            graph: &graph,
            stacks: &stacks,
            provider: provider.clone(),
            cancel,
        };
        apply(&cfg).await
    }

    async fn teardown(
        project: &Project,
        provider: &Arc<ScriptedProvider>,
        selection: &[String],
    ) -> Result<RunReport> {
        let graph = resolver::build_graph(project)?;
        let stacks = planner::select_stacks(&graph, selection)?;
        let cfg = ApplyConfig {
            project,
            graph: &graph,
            stacks: &stacks,
            provider: provider.clone(),
            cancel: CancelToken::new(),
        };
        destroy(&cfg).await
    }

    fn record_of(project: &Project, stack: &str) -> Option<StateRecord> {
        state::load(&project.stacks[stack].backend).unwrap()
    }

    fn status(report: &RunReport, stack: &str, node: &str) -> NodeStatus {
        report.stack(stack).unwrap().node(node).unwrap().status
    }

    #[tokio::test]
    async fn test_apply_threads_values_across_stacks() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(YAML, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        provider.set_outputs("network/vpc", attrs([("id", json!("vpc-001"))]));

        let report = run(&project, &provider).await.unwrap();
        assert!(report.success());
        let targets = provider.targets("provision");
        assert_eq!(targets.len(), 5);
        assert_eq!(targets.first().map(String::as_str), Some("network/vpc"));
        assert_eq!(targets.last().map(String::as_str), Some("app/logs"));

        let cluster = provider
            .calls()
            .into_iter()
            .find(|c| c.target() == "infra/cluster")
            .unwrap();
        assert_eq!(cluster.inputs["tags"], json!({ "vpc": "vpc-001" }));

        let network = record_of(&project, "network").unwrap();
        assert_eq!(
            network.outputs["vpc_id"],
            OutputValue::Available(json!("vpc-001"))
        );
        let infra = record_of(&project, "infra").unwrap();
        assert_eq!(infra.resources["sg"].inputs["vpc_id"], json!("vpc-001"));
        assert_eq!(infra.resources["sg"].status, ResourceStatus::Realized);
    }

    #[tokio::test]
    async fn test_cycle_makes_no_provider_calls() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
version: "1.0"
name: loop
params: { region: us-east-1 }
backend: { location: "STATE_DIR" }
stacks:
  only:
    resources:
      a: { kind: security_group, inputs: { vpc_id: "${b.vpc_id}" } }
      b: { kind: security_group, inputs: { vpc_id: "${a.vpc_id}" } }
"#;
        let project = project(yaml, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        let err = run(&project, &provider).await.unwrap_err();
        assert!(matches!(err, StrataError::CyclicDependency { .. }));
        assert_eq!(provider.call_count(), 0);
        assert!(record_of(&project, "only").is_none());
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(SOLO, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_always("solo/vpc", ProviderError::fatal("quota exceeded"));

        let report = run(&project, &provider).await.unwrap();
        assert!(!report.success());
        assert_eq!(status(&report, "solo", "vpc"), NodeStatus::Failed);
        assert_eq!(status(&report, "solo", "sg"), NodeStatus::Skipped);
        for node in ["a", "b", "c", "d"] {
            assert_eq!(status(&report, "solo", node), NodeStatus::Realized);
        }
        let sg = report.stack("solo").unwrap().node("sg").unwrap();
        assert_eq!(sg.error.as_deref(), Some("dependency 'vpc' failed"));
        assert!(!provider.targets("provision").contains(&"solo/sg".to_string()));

        let record = record_of(&project, "solo").unwrap();
        assert_eq!(record.resources["vpc"].status, ResourceStatus::Failed);
        assert!(!record.resources.contains_key("sg"));

        provider.clear_failures();
        provider.reset_calls();
        let report = run(&project, &provider).await.unwrap();
        assert!(report.success());
        assert_eq!(provider.targets("provision"), vec!["solo/vpc", "solo/sg"]);
    }

    #[tokio::test]
    async fn test_stop_on_first_halts_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(SOLO, dir.path());
        project.policy.failure = FailurePolicy::StopOnFirst;
        project.policy.concurrency = 1;
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_always("solo/vpc", ProviderError::fatal("denied"));

        let report = run(&project, &provider).await.unwrap();
        assert_eq!(provider.targets("provision"), vec!["solo/vpc"]);
        assert_eq!(status(&report, "solo", "vpc"), NodeStatus::Failed);
        let a = report.stack("solo").unwrap().node("a").unwrap();
        assert_eq!(a.status, NodeStatus::Skipped);
        assert_eq!(a.error.as_deref(), Some("stopped after failure of 'vpc'"));
    }

    #[tokio::test]
    async fn test_rerun_is_noop_and_record_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(YAML, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        run(&project, &provider).await.unwrap();

        let paths: Vec<_> = ["network", "infra", "app"]
            .iter()
            .map(|s| project.stacks[*s].backend.record_path())
            .collect();
        let before: Vec<String> = paths
            .iter()
            .map(|p| std::fs::read_to_string(p).unwrap())
            .collect();

        provider.reset_calls();
        let report = run(&project, &provider).await.unwrap();
        assert!(report.success());
        assert_eq!(provider.call_count(), 0);
        assert_eq!(report.stack("infra").unwrap().unchanged(), 3);

        let after: Vec<String> = paths
            .iter()
            .map(|p| std::fs::read_to_string(p).unwrap())
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_changed_literal_reprovisions_one_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(YAML, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        run(&project, &provider).await.unwrap();

        let logs = project
            .stacks
            .get_mut("infra")
            .unwrap()
            .nodes
            .get_mut("logs")
            .unwrap();
        logs.inputs
            .insert("name".to_string(), Expr::Literal(json!("/ecs/other")));

        provider.reset_calls();
        let report = run(&project, &provider).await.unwrap();
        assert_eq!(provider.targets("provision"), vec!["infra/logs"]);
        let node = report.stack("infra").unwrap().node("logs").unwrap();
        assert_eq!(node.action, Some(PlanAction::Update));
        assert_eq!(
            record_of(&project, "infra").unwrap().resources["logs"].inputs["name"],
            json!("/ecs/other")
        );
    }

    #[tokio::test]
    async fn test_held_lease_is_concurrent_modification() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(YAML, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        let _held = state::lock(&project.stacks["network"].backend).unwrap();

        let err = run(&project, &provider).await.unwrap_err();
        assert!(matches!(err, StrataError::ConcurrentModification { .. }));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_lease_taken_over_mid_pass_drains_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
version: "1.0"
name: pair
params: { region: us-east-1 }
backend: { location: "STATE_DIR" }
stacks:
  solo:
    resources:
      fast: { kind: log_group, inputs: { name: fast } }
      slow: { kind: log_group, inputs: { name: slow } }
"#;
        let project = project(yaml, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        provider.delay("solo/fast", Duration::from_millis(80));
        provider.delay("solo/slow", Duration::from_millis(300));

        let backend = project.stacks["solo"].backend.clone();
        let thief = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            state::force_unlock(&backend).unwrap();
            state::lock(&backend).unwrap()
        });

        let err = run(&project, &provider).await.unwrap_err();
        assert!(matches!(err, StrataError::ConcurrentModification { .. }), "{}", err);
        let timeline = provider.timeline();
        assert!(timeline.contains(&"end solo/fast".to_string()));
        assert!(timeline.contains(&"end solo/slow".to_string()), "{:?}", timeline);

        let stolen = thief.await.unwrap();
        let holder = state::lock_holder(&project.stacks["solo"].backend).unwrap().unwrap();
        assert_eq!(holder.token, stolen.token());
    }

    #[tokio::test]
    async fn test_foreign_record_is_not_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let solo = project(SOLO, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        assert!(run(&solo, &provider).await.unwrap().success());
        let before = std::fs::read(solo.stacks["solo"].backend.record_path()).unwrap();

        let yaml = r#"
version: "1.0"
name: other
params: { region: us-east-1 }
backend: { location: "STATE_DIR" }
stacks:
  impostor:
    backend: { key: solo/solo.state.yaml }
    resources:
      x: { kind: log_group, inputs: { name: x } }
"#;
        let other = project(yaml, dir.path());
        assert_eq!(
            other.stacks["impostor"].backend.canonical_path(),
            solo.stacks["solo"].backend.canonical_path()
        );
        provider.reset_calls();

        let err = run(&other, &provider).await.unwrap_err();
        assert!(matches!(err, StrataError::Config(_)), "{}", err);
        assert!(provider.targets("deprovision").is_empty());
        assert_eq!(provider.call_count(), 0);
        let after = std::fs::read(solo.stacks["solo"].backend.record_path()).unwrap();
        assert_eq!(before, after);

        let err = teardown(&other, &provider, &[]).await.unwrap_err();
        assert!(matches!(err, StrataError::Config(_)));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rerun_after_failure_provisions_only_failed() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(YAML, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_once("infra/cluster", ProviderError::retryable("throttled"));

        let report = run(&project, &provider).await.unwrap();
        assert_eq!(status(&report, "infra", "cluster"), NodeStatus::Failed);
        assert_eq!(status(&report, "infra", "sg"), NodeStatus::Realized);
        // app consumes the cluster name, which is now unavailable
        assert!(report.stack("app").unwrap().blocked.is_some());

        provider.reset_calls();
        let report = run(&project, &provider).await.unwrap();
        assert!(report.success());
        assert_eq!(
            provider.targets("provision"),
            vec!["infra/cluster", "app/logs"]
        );
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(SOLO, dir.path());
        project.policy.retries = 2;
        project.policy.retry_backoff_ms = 1;
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_once("solo/a", ProviderError::retryable("throttled"));
        provider.fail_once("solo/a", ProviderError::retryable("throttled"));
        provider.fail_once("solo/b", ProviderError::fatal("denied"));

        let report = run(&project, &provider).await.unwrap();
        assert_eq!(status(&report, "solo", "a"), NodeStatus::Realized);
        assert_eq!(status(&report, "solo", "b"), NodeStatus::Failed);
        let targets = provider.targets("provision");
        assert_eq!(targets.iter().filter(|t| *t == "solo/a").count(), 3);
        assert_eq!(targets.iter().filter(|t| *t == "solo/b").count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_output_blocks_downstream_stacks() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(YAML, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_always("network/vpc", ProviderError::fatal("no capacity"));

        let report = run(&project, &provider).await.unwrap();
        assert_eq!(provider.targets("provision"), vec!["network/vpc"]);

        let infra = report.stack("infra").unwrap();
        let reason = infra.blocked.as_deref().unwrap();
        assert!(reason.contains("vpc_id"));
        assert_eq!(infra.count(NodeStatus::Skipped), 3);

        let app = report.stack("app").unwrap();
        assert!(app.blocked.as_deref().unwrap().contains("infra"));
        assert_eq!(
            record_of(&project, "network").unwrap().outputs["vpc_id"],
            OutputValue::Unavailable
        );
        assert!(record_of(&project, "infra").is_none());
    }

    #[tokio::test]
    async fn test_cancel_finishes_in_flight_and_skips_rest() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(YAML, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        provider.delay("network/vpc", Duration::from_millis(150));

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let report = run_with(&project, &provider, &[], cancel).await.unwrap();
        assert_eq!(provider.targets("provision"), vec!["network/vpc"]);
        assert_eq!(status(&report, "network", "vpc"), NodeStatus::Realized);
        assert!(record_of(&project, "network").unwrap().resources.contains_key("vpc"));
        assert_eq!(
            report.stack("infra").unwrap().blocked.as_deref(),
            Some("run cancelled")
        );
        assert_eq!(report.skipped(), 4);
    }

    #[tokio::test]
    async fn test_concurrency_bound_and_producer_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(SOLO, dir.path());
        project.policy.concurrency = 2;
        let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(20)));

        let report = run(&project, &provider).await.unwrap();
        assert!(report.success());
        assert_eq!(provider.peak_concurrency(), 2);

        let timeline = provider.timeline();
        let at = |marker: &str| timeline.iter().position(|m| m == marker).unwrap();
        assert!(at("end solo/vpc") < at("start solo/sg"));
    }

    #[tokio::test]
    async fn test_orphan_is_deprovisioned() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(YAML, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        run(&project, &provider).await.unwrap();

        project
            .stacks
            .get_mut("infra")
            .unwrap()
            .nodes
            .shift_remove("logs");
        provider.reset_calls();
        let report = run(&project, &provider).await.unwrap();

        assert_eq!(provider.targets("provision"), Vec::<String>::new());
        assert_eq!(provider.targets("deprovision"), vec!["infra/logs"]);
        assert_eq!(status(&report, "infra", "logs"), NodeStatus::Destroyed);
        assert!(!record_of(&project, "infra").unwrap().resources.contains_key("logs"));
    }

    #[tokio::test]
    async fn test_destroy_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(YAML, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        run(&project, &provider).await.unwrap();

        provider.reset_calls();
        let report = teardown(&project, &provider, &[]).await.unwrap();
        assert!(report.success());
        assert_eq!(
            provider.targets("deprovision"),
            vec![
                "app/logs",
                "infra/logs",
                "infra/cluster",
                "infra/sg",
                "network/vpc"
            ]
        );
        let network = record_of(&project, "network").unwrap();
        assert!(network.resources.is_empty());
        assert!(network.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_failure_keeps_entry_and_blocks_producers() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(YAML, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        run(&project, &provider).await.unwrap();

        provider.reset_calls();
        provider.fail_always("infra/cluster", ProviderError::fatal("services still running"));
        let report = teardown(&project, &provider, &[]).await.unwrap();

        assert_eq!(status(&report, "infra", "cluster"), NodeStatus::Failed);
        assert_eq!(status(&report, "infra", "sg"), NodeStatus::Destroyed);
        assert!(report.stack("network").unwrap().blocked.is_some());
        assert!(!provider.targets("deprovision").contains(&"network/vpc".to_string()));

        let infra = record_of(&project, "infra").unwrap();
        assert_eq!(infra.resources.keys().collect::<Vec<_>>(), vec!["cluster"]);
        assert_eq!(infra.outputs["sg_id"], OutputValue::Unavailable);
        assert!(infra.outputs["cluster_name"].as_available().is_some());
    }

    #[tokio::test]
    async fn test_destroy_subset_with_live_consumer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(YAML, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        run(&project, &provider).await.unwrap();

        provider.reset_calls();
        let err = teardown(&project, &provider, &["network".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Config(_)));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_provenance_events_written() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(YAML, dir.path());
        let provider = Arc::new(ScriptedProvider::new());
        run(&project, &provider).await.unwrap();

        let path = eventlog::event_log_path(&project.stacks["network"].backend.record_path());
        let events = eventlog::read_events(&path).unwrap();
        assert!(matches!(
            events.first().map(|e| &e.event),
            Some(ProvenanceEvent::PassStarted { .. })
        ));
        assert!(events
            .iter()
            .any(|e| matches!(&e.event, ProvenanceEvent::NodeRealized { node, .. } if node == "vpc")));
        assert!(matches!(
            events.last().map(|e| &e.event),
            Some(ProvenanceEvent::PassCompleted { realized: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_provenance_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(YAML, dir.path());
        project.policy.provenance = false;
        let provider = Arc::new(ScriptedProvider::new());
        run(&project, &provider).await.unwrap();

        let path = eventlog::event_log_path(&project.stacks["network"].backend.record_path());
        assert!(!path.exists());
    }

    #[test]
    fn test_retry_delay_is_linear_and_saturates() {
        let base = Duration::from_millis(500);
        assert_eq!(retry_delay(base, 1), base);
        assert_eq!(retry_delay(base, 3), Duration::from_millis(1500));
        assert_eq!(retry_delay(Duration::from_millis(u64::MAX), 2), Duration::MAX);
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
