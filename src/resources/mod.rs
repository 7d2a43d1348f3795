//! Resource kinds: static input/output schemas and simulated attributes.
//!
//! Each kind declares:
//! 1. Required and optional input names, checked at declaration time
//! 2. The output attributes a provider must report, so tokens can be
//!    validated before anything runs
//! 3. A deterministic simulation used by the local provider

pub mod container;
pub mod iam;
pub mod load_balancer;
pub mod network;

use crate::core::types::{Attributes, ResourceKind};
use crate::provenance::hasher;
use serde_json::Value;

/// AWS-style account id used in simulated ARNs.
pub const ACCOUNT_ID: &str = "000000000000";

/// Every supported kind, in schema order.
pub const ALL_KINDS: [ResourceKind; 15] = [
    ResourceKind::Vpc,
    ResourceKind::SecurityGroup,
    ResourceKind::LoadBalancer,
    ResourceKind::LbListener,
    ResourceKind::LbTargetGroup,
    ResourceKind::LbListenerRule,
    ResourceKind::EcsCluster,
    ResourceKind::EcrRepository,
    ResourceKind::EcrLifecyclePolicy,
    ResourceKind::LogGroup,
    ResourceKind::IamPolicyDocument,
    ResourceKind::IamRole,
    ResourceKind::IamRolePolicyAttachment,
    ResourceKind::EcsTaskDefinition,
    ResourceKind::EcsService,
];

/// Declared inputs and outputs of one kind.
#[derive(Debug)]
pub struct KindSchema {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
    pub outputs: &'static [&'static str],
}

impl KindSchema {
    pub fn accepts(&self, input: &str) -> bool {
        self.required.contains(&input) || self.optional.contains(&input)
    }

    pub fn exports(&self, attribute: &str) -> bool {
        self.outputs.contains(&attribute)
    }
}

pub fn schema(kind: ResourceKind) -> &'static KindSchema {
    match kind {
        ResourceKind::Vpc => &network::VPC,
        ResourceKind::SecurityGroup => &network::SECURITY_GROUP,
        ResourceKind::LoadBalancer => &load_balancer::LOAD_BALANCER,
        ResourceKind::LbListener => &load_balancer::LISTENER,
        ResourceKind::LbTargetGroup => &load_balancer::TARGET_GROUP,
        ResourceKind::LbListenerRule => &load_balancer::LISTENER_RULE,
        ResourceKind::EcsCluster => &container::CLUSTER,
        ResourceKind::EcrRepository => &container::REPOSITORY,
        ResourceKind::EcrLifecyclePolicy => &container::LIFECYCLE_POLICY,
        ResourceKind::LogGroup => &container::LOG_GROUP,
        ResourceKind::IamPolicyDocument => &iam::POLICY_DOCUMENT,
        ResourceKind::IamRole => &iam::ROLE,
        ResourceKind::IamRolePolicyAttachment => &iam::ROLE_POLICY_ATTACHMENT,
        ResourceKind::EcsTaskDefinition => &container::TASK_DEFINITION,
        ResourceKind::EcsService => &container::SERVICE,
    }
}

/// Check declared input names against the kind's schema.
pub fn check_inputs<'a>(
    kind: ResourceKind,
    inputs: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let schema = schema(kind);
    let given: Vec<&str> = inputs.into_iter().collect();
    let mut problems = Vec::new();

    for required in schema.required {
        if !given.contains(required) {
            problems.push(format!("missing required input '{}'", required));
        }
    }
    for name in &given {
        if !schema.accepts(name) {
            problems.push(format!("unknown input '{}' for kind {}", name, kind));
        }
    }
    problems
}

/// Everything a simulation needs to fabricate attributes.
pub struct SimContext<'a> {
    pub stack: &'a str,
    pub address: &'a str,
    pub region: &'a str,
    pub inputs: &'a Attributes,
    pub prior: Option<&'a Attributes>,
}

impl SimContext<'_> {
    /// Short stable suffix derived from the node's identity.
    pub fn seed(&self) -> String {
        let hash = hasher::hash_string(&format!("{}/{}", self.stack, self.address));
        hash.trim_start_matches("blake3:").chars().take(8).collect()
    }

    /// Prior attribute if the node was realized before.
    pub fn prior(&self, attribute: &str) -> Option<&Value> {
        self.prior.and_then(|p| p.get(attribute))
    }

    /// Keep the prior id on update, otherwise `<prefix>-<seed>`.
    pub fn id(&self, prefix: &str) -> String {
        match self.prior("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => format!("{}-{}", prefix, self.seed()),
        }
    }

    pub fn input_str(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).and_then(Value::as_str)
    }

    /// The `name` input, or the node address.
    pub fn name(&self) -> String {
        self.input_str("name").unwrap_or(self.address).to_string()
    }

    pub fn arn(&self, service: &str, resource: &str) -> String {
        format!(
            "arn:aws:{}:{}:{}:{}",
            service, self.region, ACCOUNT_ID, resource
        )
    }
}

/// Build an attribute map from literal pairs.
pub fn attrs<const N: usize>(pairs: [(&str, Value); N]) -> Attributes {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Fabricate the attributes a real provider would report.
pub fn simulate(kind: ResourceKind, ctx: &SimContext) -> Attributes {
    match kind {
        ResourceKind::Vpc => network::simulate_vpc(ctx),
        ResourceKind::SecurityGroup => network::simulate_security_group(ctx),
        ResourceKind::LoadBalancer => load_balancer::simulate_load_balancer(ctx),
        ResourceKind::LbListener => load_balancer::simulate_listener(ctx),
        ResourceKind::LbTargetGroup => load_balancer::simulate_target_group(ctx),
        ResourceKind::LbListenerRule => load_balancer::simulate_listener_rule(ctx),
        ResourceKind::EcsCluster => container::simulate_cluster(ctx),
        ResourceKind::EcrRepository => container::simulate_repository(ctx),
        ResourceKind::EcrLifecyclePolicy => container::simulate_lifecycle_policy(ctx),
        ResourceKind::LogGroup => container::simulate_log_group(ctx),
        ResourceKind::IamPolicyDocument => iam::simulate_policy_document(ctx),
        ResourceKind::IamRole => iam::simulate_role(ctx),
        ResourceKind::IamRolePolicyAttachment => iam::simulate_role_policy_attachment(ctx),
        ResourceKind::EcsTaskDefinition => container::simulate_task_definition(ctx),
        ResourceKind::EcsService => container::simulate_service(ctx),
    }
}
