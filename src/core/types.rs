//! Configuration schema, declared model, state records, plans and reports.
//!
//! Three layers live here:
//! - the YAML schema (`StrataConfig` and friends), deserialized as written
//! - the declared model (`Project`, `StackSpec`, `NodeSpec`) produced by the
//!   declaration pass, with every input parsed into an [`Expr`]
//! - the runtime vocabulary shared by planner, engine and state store

use super::token::{Expr, TokenLookup};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Component, PathBuf};
use std::time::Duration;

/// Realized (or resolved) attributes of one node, in declaration order.
pub type Attributes = IndexMap<String, Value>;

// ============================================================================
// Top-level strata.yaml
// ============================================================================

/// Root configuration: every stack of one application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Human-readable project name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Parameters seeding literal inputs (`{{params.key}}`)
    #[serde(default)]
    pub params: IndexMap<String, Value>,

    /// Default state backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Stack declarations (order-preserving)
    pub stacks: IndexMap<String, StackConfig>,

    #[serde(default)]
    pub policy: Policy,
}

/// Project-wide backend defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Directory holding state records
    #[serde(default = "default_location")]
    pub location: String,

    /// Prefix for derived record keys (`<prefix>/<stack>.state.yaml`)
    #[serde(default)]
    pub key_prefix: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            location: default_location(),
            key_prefix: None,
        }
    }
}

fn default_location() -> String {
    "state".to_string()
}

/// One stack as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default)]
    pub description: Option<String>,

    /// Region; falls back to `params.region`
    #[serde(default)]
    pub region: Option<String>,

    /// Per-stack backend override
    #[serde(default)]
    pub backend: Option<StackBackendConfig>,

    pub resources: IndexMap<String, ResourceConfig>,

    #[serde(default)]
    pub outputs: IndexMap<String, OutputConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackBackendConfig {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

/// One resource node as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub kind: ResourceKind,

    #[serde(default)]
    pub inputs: IndexMap<String, Value>,

    /// Ordering-only edges to nodes in the same stack
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Output declaration: bare value or value with description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputConfig {
    Detailed {
        value: Value,
        #[serde(default)]
        description: Option<String>,
    },
    Bare(Value),
}

impl OutputConfig {
    pub fn value(&self) -> &Value {
        match self {
            Self::Detailed { value, .. } => value,
            Self::Bare(v) => v,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            Self::Detailed { description, .. } => description.as_deref(),
            Self::Bare(_) => None,
        }
    }
}

// ============================================================================
// Resource kinds
// ============================================================================

/// Closed set of resource kinds. Each has a static schema in `resources`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Vpc,
    SecurityGroup,
    LoadBalancer,
    LbListener,
    LbTargetGroup,
    LbListenerRule,
    EcsCluster,
    EcrRepository,
    EcrLifecyclePolicy,
    LogGroup,
    IamPolicyDocument,
    IamRole,
    IamRolePolicyAttachment,
    EcsTaskDefinition,
    EcsService,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::SecurityGroup => "security_group",
            Self::LoadBalancer => "load_balancer",
            Self::LbListener => "lb_listener",
            Self::LbTargetGroup => "lb_target_group",
            Self::LbListenerRule => "lb_listener_rule",
            Self::EcsCluster => "ecs_cluster",
            Self::EcrRepository => "ecr_repository",
            Self::EcrLifecyclePolicy => "ecr_lifecycle_policy",
            Self::LogGroup => "log_group",
            Self::IamPolicyDocument => "iam_policy_document",
            Self::IamRole => "iam_role",
            Self::IamRolePolicyAttachment => "iam_role_policy_attachment",
            Self::EcsTaskDefinition => "ecs_task_definition",
            Self::EcsService => "ecs_service",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Upper bound on in-flight provider calls within one stack
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Extra attempts for retryable provider errors
    #[serde(default)]
    pub retries: u32,

    /// Delay before retry `n` is `n * retry_backoff_ms`
    #[serde(default = "default_backoff")]
    pub retry_backoff_ms: u64,

    /// Append provenance events next to each state record
    #[serde(default = "default_true")]
    pub provenance: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            failure: FailurePolicy::default(),
            concurrency: default_concurrency(),
            retries: 0,
            retry_backoff_ms: default_backoff(),
            provenance: true,
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_backoff() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

/// Failure handling strategy within a stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching after the first failure; in-flight calls finish.
    StopOnFirst,
    /// Skip dependents of a failed node, keep evaluating everything else.
    #[default]
    ContinueIndependent,
}

// ============================================================================
// Declared model
// ============================================================================

/// Where one stack's state record lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendDescriptor {
    pub location: String,
    pub key: String,
}

impl BackendDescriptor {
    pub fn record_path(&self) -> PathBuf {
        PathBuf::from(&self.location).join(&self.key)
    }

    /// Record path made absolute against the working directory and cleaned
    /// lexically (`.` dropped, `..` folded). Two descriptors naming the same
    /// file compare equal here even when spelled differently.
    pub fn canonical_path(&self) -> PathBuf {
        let path = self.record_path();
        let path = if path.is_relative() {
            std::env::current_dir().map(|cwd| cwd.join(&path)).unwrap_or(path)
        } else {
            path
        };

        let mut clean = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if matches!(clean.components().next_back(), Some(Component::Normal(_))) {
                        clean.pop();
                    } else if !clean.has_root() {
                        clean.push("..");
                    }
                }
                other => clean.push(other.as_os_str()),
            }
        }
        clean
    }
}

impl fmt::Display for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.record_path().display())
    }
}

/// Output of the declaration pass.
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub stacks: IndexMap<String, StackSpec>,
    pub policy: Policy,
}

#[derive(Debug, Clone)]
pub struct StackSpec {
    pub name: String,
    pub region: String,
    pub backend: BackendDescriptor,
    pub nodes: IndexMap<String, NodeSpec>,
    pub outputs: IndexMap<String, OutputSpec>,
}

#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub address: String,
    pub kind: ResourceKind,
    pub inputs: IndexMap<String, Expr>,
    pub depends_on: Vec<String>,
}

impl NodeSpec {
    /// Resolve every input; fails on the first unresolved token.
    pub fn resolve_inputs(&self, lookup: &dyn TokenLookup) -> crate::error::Result<Attributes> {
        let mut resolved = Attributes::new();
        for (name, expr) in &self.inputs {
            resolved.insert(name.clone(), expr.resolve(lookup)?);
        }
        Ok(resolved)
    }
}

#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub expr: Expr,
    pub description: Option<String>,
}

// ============================================================================
// Node lifecycle
// ============================================================================

/// Per-node state during one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Resolving,
    Provisioning,
    Realized,
    Failed,
    Skipped,
    Destroyed,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Realized | Self::Failed | Self::Skipped | Self::Destroyed
        )
    }

    /// Legal transitions. `Resolving → Realized` is the no-op path;
    /// `Pending → Provisioning → Destroyed` is the teardown path.
    pub fn can_become(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Pending, Resolving)
                | (Pending, Skipped)
                | (Pending, Provisioning)
                | (Resolving, Provisioning)
                | (Resolving, Realized)
                | (Resolving, Failed)
                | (Provisioning, Realized)
                | (Provisioning, Failed)
                | (Provisioning, Destroyed)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Resolving => write!(f, "RESOLVING"),
            Self::Provisioning => write!(f, "PROVISIONING"),
            Self::Realized => write!(f, "REALIZED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

// ============================================================================
// State record
// ============================================================================

/// Per-stack state record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub schema: String,

    pub stack: String,

    pub region: String,

    /// Bumped on every save; conditional writes compare it
    pub serial: u64,

    pub generated_at: String,

    pub generator: String,

    /// Per-node realized state (order-preserving)
    #[serde(default)]
    pub resources: IndexMap<String, ResourceRecord>,

    /// Computed stack outputs
    #[serde(default)]
    pub outputs: IndexMap<String, OutputValue>,
}

/// Per-node record entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,

    pub status: ResourceStatus,

    /// BLAKE3 hash of kind + resolved inputs at last successful provision
    pub inputs_hash: String,

    #[serde(default)]
    pub inputs: Attributes,

    #[serde(default)]
    pub outputs: Attributes,

    #[serde(default)]
    pub applied_at: Option<String>,

    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

/// Recorded convergence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Realized,
    Failed,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Realized => write!(f, "REALIZED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A stack output after its pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum OutputValue {
    Available(Value),
    Unavailable,
}

impl OutputValue {
    pub fn as_available(&self) -> Option<&Value> {
        match self {
            Self::Available(v) => Some(v),
            Self::Unavailable => None,
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Destroy,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub stack: String,
    pub address: String,
    pub kind: ResourceKind,
    pub action: PlanAction,
    pub description: String,
}

/// Full execution plan across the selected stacks.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub name: String,

    /// Stacks in evaluation order
    pub stack_order: Vec<String>,

    /// Planned changes in evaluation order
    pub changes: Vec<PlannedChange>,

    pub to_create: u32,
    pub to_update: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    PassStarted {
        stack: String,
        run_id: String,
        action: String,
        strata_version: String,
    },
    NodeStarted {
        stack: String,
        node: String,
        action: String,
    },
    NodeRealized {
        stack: String,
        node: String,
        duration_seconds: f64,
        hash: String,
    },
    NodeFailed {
        stack: String,
        node: String,
        error: String,
        retryable: bool,
    },
    NodeSkipped {
        stack: String,
        node: String,
        reason: String,
    },
    NodeDestroyed {
        stack: String,
        node: String,
        duration_seconds: f64,
    },
    PassCompleted {
        stack: String,
        run_id: String,
        realized: u32,
        unchanged: u32,
        failed: u32,
        skipped: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Run report
// ============================================================================

/// Terminal outcome of one node.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub address: String,
    pub kind: ResourceKind,
    pub status: NodeStatus,
    /// What the pass did; `None` when the node never got that far
    pub action: Option<PlanAction>,
    pub error: Option<String>,
}

/// Result of one stack pass.
#[derive(Debug, Clone)]
pub struct StackReport {
    pub stack: String,
    pub nodes: Vec<NodeReport>,
    pub outputs: IndexMap<String, OutputValue>,
    /// Why the stack never started, if it was blocked
    pub blocked: Option<String>,
    pub total_duration: Duration,
}

impl StackReport {
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Nodes the provider actually touched.
    pub fn changed(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| {
                matches!(n.status, NodeStatus::Realized | NodeStatus::Destroyed)
                    && n.action != Some(PlanAction::NoOp)
            })
            .count()
    }

    pub fn unchanged(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.action == Some(PlanAction::NoOp))
            .count()
    }

    pub fn node(&self, address: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.address == address)
    }
}

/// Consolidated report of a run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub stacks: Vec<StackReport>,
}

impl RunReport {
    pub fn stack(&self, name: &str) -> Option<&StackReport> {
        self.stacks.iter().find(|s| s.stack == name)
    }

    pub fn failed(&self) -> usize {
        self.stacks.iter().map(|s| s.count(NodeStatus::Failed)).sum()
    }

    pub fn skipped(&self) -> usize {
        self.stacks.iter().map(|s| s.count(NodeStatus::Skipped)).sum()
    }

    /// True when every node reached its goal and no stack was blocked.
    pub fn success(&self) -> bool {
        self.failed() == 0 && self.skipped() == 0 && self.stacks.iter().all(|s| s.blocked.is_none())
    }
}
