//! External plugin provider.
//!
//! Runs `<program> [args..] provision|deprovision` with the JSON request on
//! stdin. On success the plugin prints a JSON object of attributes on stdout
//! (deprovision may print nothing). Exit code 75 (EX_TEMPFAIL) marks the
//! failure retryable; any other non-zero exit is fatal.

use super::{DeprovisionRequest, ProvisionRequest, ResourceProvider};
use crate::core::types::Attributes;
use crate::error::{ProviderError, StrataError};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit code a plugin uses for transient failures.
pub const EX_TEMPFAIL: i32 = 75;

/// Output from one plugin invocation.
#[derive(Debug, Clone)]
pub struct PluginOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl PluginOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn into_error(self, operation: &str) -> ProviderError {
        let detail = match self.stderr.trim() {
            "" => format!("exit code {}", self.exit_code),
            msg => msg.to_string(),
        };
        let message = format!("plugin {} failed: {}", operation, detail);
        if self.exit_code == EX_TEMPFAIL {
            ProviderError::retryable(message)
        } else {
            ProviderError::fatal(message)
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
}

impl CommandProvider {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace-separated command line such as `"./aws-plugin --profile dev"`.
    pub fn from_command_line(line: &str) -> Result<Self, StrataError> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| StrataError::Config("provider command is empty".to_string()))?;
        Ok(Self::new(program, parts.collect()))
    }

    async fn invoke(&self, operation: &str, body: &impl Serialize) -> Result<PluginOutput, ProviderError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| ProviderError::fatal(format!("cannot encode request: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(operation)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::fatal(format!("failed to spawn {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ProviderError::fatal(format!("stdin write error: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::fatal(format!("wait error: {}", e)))?;

        Ok(PluginOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl ResourceProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.program
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<Attributes, ProviderError> {
        let out = self.invoke("provision", request).await?;
        if !out.success() {
            return Err(out.into_error("provision"));
        }
        serde_json::from_str(out.stdout.trim()).map_err(|e| {
            ProviderError::fatal(format!(
                "plugin provision for {} returned invalid attributes: {}",
                request.address, e
            ))
        })
    }

    async fn deprovision(&self, request: &DeprovisionRequest) -> Result<(), ProviderError> {
        let out = self.invoke("deprovision", request).await?;
        if !out.success() {
            return Err(out.into_error("deprovision"));
        }
        Ok(())
    }
}
