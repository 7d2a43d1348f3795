//! Load balancer kinds: balancer, listener, target group, listener rule.
//!
//! Load balancer objects are identified by ARN, so `id` and `arn` coincide.

use super::{attrs, KindSchema, SimContext};
use crate::core::types::Attributes;
use serde_json::{json, Value};

pub const LOAD_BALANCER: KindSchema = KindSchema {
    required: &["subnets"],
    optional: &["name", "internal", "load_balancer_type", "security_groups", "tags"],
    outputs: &["id", "arn", "dns_name"],
};

pub const LISTENER: KindSchema = KindSchema {
    required: &["load_balancer_arn", "port", "protocol"],
    optional: &["default_action"],
    outputs: &["id", "arn"],
};

pub const TARGET_GROUP: KindSchema = KindSchema {
    required: &["port", "protocol", "vpc_id"],
    optional: &["name", "target_type", "health_check"],
    outputs: &["id", "arn", "name"],
};

pub const LISTENER_RULE: KindSchema = KindSchema {
    required: &["listener_arn", "action"],
    optional: &["condition", "priority"],
    outputs: &["id", "arn"],
};

/// Reuse the prior ARN on update, otherwise build a fresh one.
fn arn_or_prior(ctx: &SimContext, fresh: impl FnOnce() -> String) -> String {
    ctx.prior("arn")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(fresh)
}

pub fn simulate_load_balancer(ctx: &SimContext) -> Attributes {
    let name = format!("{}-{}", ctx.name(), &ctx.seed()[..4]);
    let arn = arn_or_prior(ctx, || {
        ctx.arn(
            "elasticloadbalancing",
            &format!("loadbalancer/app/{}/{}", name, ctx.seed()),
        )
    });
    let internal = ctx
        .inputs
        .get("internal")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let dns = if internal {
        format!("internal-{}.{}.elb.amazonaws.com", name, ctx.region)
    } else {
        format!("{}.{}.elb.amazonaws.com", name, ctx.region)
    };
    attrs([("id", json!(arn)), ("arn", json!(arn)), ("dns_name", json!(dns))])
}

pub fn simulate_listener(ctx: &SimContext) -> Attributes {
    let arn = arn_or_prior(ctx, || {
        let lb = ctx
            .input_str("load_balancer_arn")
            .and_then(|a| a.split_once("loadbalancer/"))
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_else(|| ctx.address.to_string());
        ctx.arn(
            "elasticloadbalancing",
            &format!("listener/{}/{}", lb, ctx.seed()),
        )
    });
    attrs([("id", json!(arn)), ("arn", json!(arn))])
}

pub fn simulate_target_group(ctx: &SimContext) -> Attributes {
    let name = ctx.name();
    let arn = arn_or_prior(ctx, || {
        ctx.arn(
            "elasticloadbalancing",
            &format!("targetgroup/{}/{}", name, ctx.seed()),
        )
    });
    attrs([("id", json!(arn)), ("arn", json!(arn)), ("name", json!(name))])
}

pub fn simulate_listener_rule(ctx: &SimContext) -> Attributes {
    let arn = arn_or_prior(ctx, || {
        let listener = ctx
            .input_str("listener_arn")
            .and_then(|a| a.split_once("listener/"))
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_else(|| ctx.address.to_string());
        ctx.arn(
            "elasticloadbalancing",
            &format!("listener-rule/{}/{}", listener, ctx.seed()),
        )
    });
    attrs([("id", json!(arn)), ("arn", json!(arn))])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_arn_nests_under_balancer() {
        let lb_inputs = attrs([("subnets", json!(["subnet-a"])), ("name", json!("alb"))]);
        let lb_ctx = SimContext {
            stack: "infra",
            address: "alb",
            region: "us-east-1",
            inputs: &lb_inputs,
            prior: None,
        };
        let lb = simulate_load_balancer(&lb_ctx);
        assert!(lb["dns_name"].as_str().unwrap().ends_with(".us-east-1.elb.amazonaws.com"));

        let listener_inputs = attrs([
            ("load_balancer_arn", lb["arn"].clone()),
            ("port", json!(80)),
            ("protocol", json!("HTTP")),
        ]);
        let listener_ctx = SimContext {
            stack: "infra",
            address: "alb-listener",
            region: "us-east-1",
            inputs: &listener_inputs,
            prior: None,
        };
        let listener = simulate_listener(&listener_ctx);
        let arn = listener["arn"].as_str().unwrap();
        assert!(arn.contains(":listener/app/alb-"));
    }

    #[test]
    fn test_internal_balancer_dns() {
        let inputs = attrs([("subnets", json!([])), ("internal", json!(true))]);
        let ctx = SimContext {
            stack: "infra",
            address: "alb",
            region: "eu-west-1",
            inputs: &inputs,
            prior: None,
        };
        let out = simulate_load_balancer(&ctx);
        assert!(out["dns_name"].as_str().unwrap().starts_with("internal-"));
    }

    #[test]
    fn test_target_group_keeps_arn_on_update() {
        let inputs = attrs([
            ("port", json!(8080)),
            ("protocol", json!("HTTP")),
            ("vpc_id", json!("vpc-001")),
            ("name", json!("svc-tg")),
        ]);
        let prior = attrs([("arn", json!("arn:kept"))]);
        let ctx = SimContext {
            stack: "java_api",
            address: "svc-target-group",
            region: "us-east-1",
            inputs: &inputs,
            prior: Some(&prior),
        };
        let out = simulate_target_group(&ctx);
        assert_eq!(out["arn"], json!("arn:kept"));
        assert_eq!(out["name"], json!("svc-tg"));
    }
}
