//! YAML parsing, the declaration pass, and validation.
//!
//! Parses strata.yaml and turns it into a declared [`Project`]:
//! - `{{params.key}}` templates are expanded (after `--param` overrides)
//! - every input and output becomes an [`Expr`]
//! - regions and backend descriptors are filled in from defaults
//!
//! Validation then checks structural constraints:
//! - Version must be "1.0", name non-empty, at least one stack
//! - Inputs match the kind's schema
//! - Token references name existing nodes and exported attributes
//! - depends_on references must exist and not point at the node itself
//! - No two stacks share a state record

use super::resolver::{self, export_table};
use super::token::{parse_expr, Expr};
use super::types::*;
use crate::error::{Result, StrataError};
use crate::resources;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Parse a strata.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<StrataConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| StrataError::io(path, e))?;
    parse_config(&content).map_err(|e| match e {
        StrataError::Parse { reason, .. } => StrataError::Parse {
            origin: path.display().to_string(),
            reason,
        },
        other => other,
    })
}

/// Parse a strata.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<StrataConfig> {
    serde_yaml_ng::from_str(yaml).map_err(|e| StrataError::Parse {
        origin: "strata.yaml".to_string(),
        reason: e.to_string(),
    })
}

/// Parse a `key=value` override. The value is read as a YAML scalar, so
/// `count=2` yields a number and `env=prod` a string.
pub fn parse_param_override(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw.split_once('=').ok_or_else(|| {
        StrataError::Config(format!("param override '{}' must be key=value", raw))
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(StrataError::Config(format!(
            "param override '{}' has an empty key",
            raw
        )));
    }
    let parsed = match serde_yaml_ng::from_str::<Value>(value) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => v,
        _ => Value::String(value.to_string()),
    };
    Ok((key.to_string(), parsed))
}

/// Apply `--param` overrides on top of the declared params.
pub fn apply_param_overrides(config: &mut StrataConfig, overrides: &[(String, Value)]) {
    for (key, value) in overrides {
        config.params.insert(key.clone(), value.clone());
    }
}

fn stack_error(stack: &str, message: impl std::fmt::Display) -> StrataError {
    StrataError::Config(format!("stack '{}': {}", stack, message))
}

/// Run the declaration pass: templating, expression parsing, defaults.
pub fn declare(config: &StrataConfig) -> Result<Project> {
    let params = &config.params;
    let default_location = resolver::resolve_template(&config.backend.location, params)?;
    let key_prefix = match &config.backend.key_prefix {
        Some(prefix) => resolver::resolve_template(prefix, params)?,
        None => config.name.clone(),
    };

    let mut stacks = IndexMap::new();
    for (name, stack) in &config.stacks {
        let region = match &stack.region {
            Some(r) => resolver::resolve_template(r, params)?,
            None => params
                .get("region")
                .map(super::token::value_to_text)
                .ok_or_else(|| stack_error(name, "no region and params.region is unset"))?,
        };

        let overrides = stack.backend.clone().unwrap_or_default();
        let location = match overrides.location {
            Some(l) => resolver::resolve_template(&l, params)?,
            None => default_location.clone(),
        };
        let key = match overrides.key {
            Some(k) => resolver::resolve_template(&k, params)?,
            None if key_prefix.is_empty() => format!("{}.state.yaml", name),
            None => format!("{}/{}.state.yaml", key_prefix.trim_end_matches('/'), name),
        };

        let mut nodes = IndexMap::new();
        for (address, resource) in &stack.resources {
            let mut inputs = IndexMap::new();
            for (input, raw) in &resource.inputs {
                let templated = resolver::resolve_params(raw, params)?;
                inputs.insert(input.clone(), parse_expr(&templated, name)?);
            }
            nodes.insert(
                address.clone(),
                NodeSpec {
                    address: address.clone(),
                    kind: resource.kind,
                    inputs,
                    depends_on: resource.depends_on.clone(),
                },
            );
        }

        let mut outputs = IndexMap::new();
        for (output, declared) in &stack.outputs {
            let templated = resolver::resolve_params(declared.value(), params)?;
            outputs.insert(
                output.clone(),
                OutputSpec {
                    expr: parse_expr(&templated, name)?,
                    description: declared.description().map(str::to_string),
                },
            );
        }

        stacks.insert(
            name.clone(),
            StackSpec {
                name: name.clone(),
                region,
                backend: BackendDescriptor { location, key },
                nodes,
                outputs,
            },
        );
    }

    Ok(Project {
        name: config.name.clone(),
        stacks,
        policy: config.policy.clone(),
    })
}

/// Validate the raw config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &StrataConfig) -> Vec<StrataError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(StrataError::Config(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        )));
    }
    if config.name.trim().is_empty() {
        errors.push(StrataError::Config("name must not be empty".to_string()));
    }
    if config.stacks.is_empty() {
        errors.push(StrataError::Config(
            "at least one stack must be declared".to_string(),
        ));
    }
    if config.policy.concurrency == 0 {
        errors.push(StrataError::Config(
            "policy.concurrency must be at least 1".to_string(),
        ));
    }
    for (name, stack) in &config.stacks {
        if stack.resources.is_empty() {
            errors.push(stack_error(name, "declares no resources"));
        }
    }

    errors
}

/// Validate a declared project. Returns a list of errors (empty = valid).
pub fn validate_project(project: &Project) -> Vec<StrataError> {
    let mut errors = Vec::new();
    let exports = export_table(project);
    let mut backends: HashMap<PathBuf, &str> = HashMap::new();

    for (stack_name, stack) in &project.stacks {
        if let Some(other) = backends.insert(stack.backend.canonical_path(), stack_name) {
            errors.push(StrataError::Config(format!(
                "stacks '{}' and '{}' share state record {}",
                other, stack_name, stack.backend
            )));
        }

        for (address, node) in &stack.nodes {
            for problem in resources::check_inputs(node.kind, node.inputs.keys().map(String::as_str)) {
                errors.push(stack_error(
                    stack_name,
                    format!("resource '{}': {}", address, problem),
                ));
            }

            for dep in &node.depends_on {
                if dep == address {
                    errors.push(stack_error(
                        stack_name,
                        format!("resource '{}' depends on itself", address),
                    ));
                } else if !stack.nodes.contains_key(dep) {
                    errors.push(stack_error(
                        stack_name,
                        format!("resource '{}' depends on unknown resource '{}'", address, dep),
                    ));
                }
            }

            for expr in node.inputs.values() {
                check_references(project, &exports, stack_name, expr, &mut errors);
            }
        }

        for output in stack.outputs.values() {
            check_references(project, &exports, stack_name, &output.expr, &mut errors);
        }
    }

    errors
}

fn check_references(
    project: &Project,
    exports: &HashMap<super::token::Token, (String, String)>,
    consumer: &str,
    expr: &Expr,
    errors: &mut Vec<StrataError>,
) {
    for token in expr.tokens() {
        let Some(stack) = project.stacks.get(&token.stack) else {
            errors.push(StrataError::unresolved(
                token,
                format!("unknown stack '{}'", token.stack),
            ));
            continue;
        };
        let Some(node) = stack.nodes.get(&token.node) else {
            errors.push(StrataError::unresolved(
                token,
                format!("unknown node '{}' in stack '{}'", token.node, token.stack),
            ));
            continue;
        };
        if !resources::schema(node.kind).exports(&token.attribute) {
            errors.push(StrataError::unresolved(
                token,
                format!("kind {} has no attribute '{}'", node.kind, token.attribute),
            ));
            continue;
        }
        if token.stack != consumer && !exports.contains_key(token) {
            errors.push(StrataError::unresolved(
                token,
                format!("not exported as an output of stack '{}'", token.stack),
            ));
        }
    }
}

/// Parse, override, declare and validate in one go.
///
/// Every validation problem is logged; the first one is returned.
pub fn load_project(path: &Path, overrides: &[(String, Value)]) -> Result<Project> {
    let mut config = parse_config_file(path)?;
    apply_param_overrides(&mut config, overrides);
    let project = check(config)?;
    tracing::debug!(project = %project.name, stacks = project.stacks.len(), "project loaded");
    Ok(project)
}

/// Declare and validate an already-parsed config.
pub fn check(config: StrataConfig) -> Result<Project> {
    first_error(validate_config(&config))?;
    let project = declare(&config)?;
    first_error(validate_project(&project))?;
    Ok(project)
}

fn first_error(errors: Vec<StrataError>) -> Result<()> {
    for e in &errors {
        tracing::error!("{}", e);
    }
    match errors.into_iter().next() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
