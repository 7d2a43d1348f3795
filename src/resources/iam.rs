//! IAM kinds: policy documents, roles, managed policy attachments.

use super::{attrs, KindSchema, SimContext, ACCOUNT_ID};
use crate::core::types::Attributes;
use serde_json::{json, Value};

pub const POLICY_DOCUMENT: KindSchema = KindSchema {
    required: &["statement"],
    optional: &[],
    outputs: &["id", "json"],
};

pub const ROLE: KindSchema = KindSchema {
    required: &["name", "assume_role_policy"],
    optional: &["description", "tags"],
    outputs: &["id", "arn", "name"],
};

pub const ROLE_POLICY_ATTACHMENT: KindSchema = KindSchema {
    required: &["role", "policy_arn"],
    optional: &[],
    outputs: &["id"],
};

/// Render the document the way IAM expects it.
pub fn simulate_policy_document(ctx: &SimContext) -> Attributes {
    let statement = ctx.inputs.get("statement").cloned().unwrap_or(Value::Null);
    let document = json!({ "Version": "2012-10-17", "Statement": statement });
    let rendered = serde_json::to_string(&document).unwrap_or_default();
    attrs([("id", json!(ctx.id("policy"))), ("json", json!(rendered))])
}

/// IAM is global: role ARNs carry no region.
pub fn simulate_role(ctx: &SimContext) -> Attributes {
    let name = ctx.name();
    let arn = format!("arn:aws:iam::{}:role/{}", ACCOUNT_ID, name);
    attrs([("id", json!(name)), ("arn", json!(arn)), ("name", json!(name))])
}

pub fn simulate_role_policy_attachment(ctx: &SimContext) -> Attributes {
    let role = ctx.input_str("role").unwrap_or(ctx.address);
    attrs([("id", json!(format!("{}-{}", role, ctx.seed())))])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_document_json() {
        let inputs = attrs([(
            "statement",
            json!([{"actions": ["sts:AssumeRole"]}]),
        )]);
        let ctx = SimContext {
            stack: "java_api",
            address: "assume_role",
            region: "us-east-1",
            inputs: &inputs,
            prior: None,
        };
        let out = simulate_policy_document(&ctx);
        let doc: Value = serde_json::from_str(out["json"].as_str().unwrap()).unwrap();
        assert_eq!(doc["Version"], json!("2012-10-17"));
        assert_eq!(doc["Statement"][0]["actions"][0], json!("sts:AssumeRole"));
    }

    #[test]
    fn test_role_arn_is_global() {
        let inputs = attrs([
            ("name", json!("java-api-exec-role")),
            ("assume_role_policy", json!("{}")),
        ]);
        let ctx = SimContext {
            stack: "java_api",
            address: "service_execution_role",
            region: "us-east-1",
            inputs: &inputs,
            prior: None,
        };
        let out = simulate_role(&ctx);
        assert_eq!(
            out["arn"],
            json!("arn:aws:iam::000000000000:role/java-api-exec-role")
        );
    }
}
