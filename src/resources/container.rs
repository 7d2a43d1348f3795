//! Container platform kinds: ECS cluster/task/service, ECR, log groups.

use super::{attrs, KindSchema, SimContext, ACCOUNT_ID};
use crate::core::types::Attributes;
use serde_json::{json, Value};

pub const CLUSTER: KindSchema = KindSchema {
    required: &["name"],
    optional: &["tags"],
    outputs: &["id", "arn", "name"],
};

pub const REPOSITORY: KindSchema = KindSchema {
    required: &["name"],
    optional: &["image_tag_mutability", "image_scanning_configuration", "tags"],
    outputs: &["id", "arn", "name", "repository_url"],
};

pub const LIFECYCLE_POLICY: KindSchema = KindSchema {
    required: &["repository", "policy"],
    optional: &[],
    outputs: &["id", "repository"],
};

pub const LOG_GROUP: KindSchema = KindSchema {
    required: &["name"],
    optional: &["retention_in_days", "tags"],
    outputs: &["id", "arn", "name"],
};

pub const TASK_DEFINITION: KindSchema = KindSchema {
    required: &["family", "container_definitions"],
    optional: &[
        "network_mode",
        "requires_compatibilities",
        "cpu",
        "memory",
        "task_role_arn",
        "execution_role_arn",
    ],
    outputs: &["id", "arn", "family", "revision"],
};

pub const SERVICE: KindSchema = KindSchema {
    required: &["name", "cluster", "task_definition"],
    optional: &[
        "desired_count",
        "launch_type",
        "force_new_deployment",
        "network_configuration",
        "load_balancer",
    ],
    outputs: &["id", "arn", "name"],
};

pub fn simulate_cluster(ctx: &SimContext) -> Attributes {
    let name = ctx.name();
    let arn = ctx.arn("ecs", &format!("cluster/{}", name));
    attrs([("id", json!(arn)), ("arn", json!(arn)), ("name", json!(name))])
}

pub fn simulate_repository(ctx: &SimContext) -> Attributes {
    let name = ctx.name();
    let arn = ctx.arn("ecr", &format!("repository/{}", name));
    let url = format!("{}.dkr.ecr.{}.amazonaws.com/{}", ACCOUNT_ID, ctx.region, name);
    attrs([
        ("id", json!(name)),
        ("arn", json!(arn)),
        ("name", json!(name)),
        ("repository_url", json!(url)),
    ])
}

pub fn simulate_lifecycle_policy(ctx: &SimContext) -> Attributes {
    let repository = ctx
        .inputs
        .get("repository")
        .cloned()
        .unwrap_or(Value::Null);
    attrs([("id", json!(ctx.id("lcp"))), ("repository", repository)])
}

pub fn simulate_log_group(ctx: &SimContext) -> Attributes {
    let name = ctx.name();
    let arn = ctx.arn("logs", &format!("log-group:{}", name));
    attrs([("id", json!(name)), ("arn", json!(arn)), ("name", json!(name))])
}

/// Every update registers a new revision.
pub fn simulate_task_definition(ctx: &SimContext) -> Attributes {
    let family = ctx.input_str("family").unwrap_or(ctx.address).to_string();
    let revision = ctx
        .prior("revision")
        .and_then(Value::as_u64)
        .map(|r| r + 1)
        .unwrap_or(1);
    let arn = ctx.arn("ecs", &format!("task-definition/{}:{}", family, revision));
    attrs([
        ("id", json!(format!("{}:{}", family, revision))),
        ("arn", json!(arn)),
        ("family", json!(family)),
        ("revision", json!(revision)),
    ])
}

pub fn simulate_service(ctx: &SimContext) -> Attributes {
    let name = ctx.name();
    let cluster = ctx
        .input_str("cluster")
        .and_then(|c| c.rsplit('/').next())
        .unwrap_or("default")
        .to_string();
    let arn = ctx.arn("ecs", &format!("service/{}/{}", cluster, name));
    attrs([("id", json!(arn)), ("arn", json!(arn)), ("name", json!(name))])
}
