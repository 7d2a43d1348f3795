//! Network kinds: VPC with subnets, security groups.

use super::{attrs, KindSchema, SimContext};
use crate::core::types::Attributes;
use serde_json::{json, Value};

pub const VPC: KindSchema = KindSchema {
    required: &["cidr_block"],
    optional: &[
        "name",
        "azs",
        "public_subnet_cidrs",
        "private_subnet_cidrs",
        "enable_nat_gateway",
        "tags",
    ],
    outputs: &["id", "arn", "cidr_block", "public_subnets", "private_subnets"],
};

pub const SECURITY_GROUP: KindSchema = KindSchema {
    required: &["vpc_id"],
    optional: &["name", "description", "ingress", "egress", "tags"],
    outputs: &["id", "arn", "vpc_id"],
};

/// Subnet ids for a tier; two per tier unless CIDRs are listed.
fn subnets(ctx: &SimContext, tier: &str, cidrs_input: &str) -> Value {
    let count = ctx
        .inputs
        .get(cidrs_input)
        .and_then(Value::as_array)
        .map(|a| a.len())
        .unwrap_or(2);
    let seed = ctx.seed();
    Value::Array(
        (0..count)
            .map(|i| json!(format!("subnet-{}{}{}", seed, tier, i)))
            .collect(),
    )
}

pub fn simulate_vpc(ctx: &SimContext) -> Attributes {
    let id = ctx.id("vpc");
    let arn = ctx.arn("ec2", &format!("vpc/{}", id));
    attrs([
        ("id", json!(id)),
        ("arn", json!(arn)),
        ("cidr_block", ctx.inputs.get("cidr_block").cloned().unwrap_or(Value::Null)),
        ("public_subnets", subnets(ctx, "pub", "public_subnet_cidrs")),
        ("private_subnets", subnets(ctx, "prv", "private_subnet_cidrs")),
    ])
}

pub fn simulate_security_group(ctx: &SimContext) -> Attributes {
    let id = ctx.id("sg");
    let arn = ctx.arn("ec2", &format!("security-group/{}", id));
    attrs([
        ("id", json!(id)),
        ("arn", json!(arn)),
        ("vpc_id", ctx.inputs.get("vpc_id").cloned().unwrap_or(Value::Null)),
    ])
}
