//! Deterministic local simulator.
//!
//! Ids derive from the node's identity, so repeated runs against a fresh
//! state directory produce identical records.

use super::{DeprovisionRequest, ProvisionRequest, ResourceProvider};
use crate::core::types::Attributes;
use crate::error::ProviderError;
use crate::resources::{self, SimContext};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct LocalProvider {
    latency: Option<Duration>,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `latency` on every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ResourceProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<Attributes, ProviderError> {
        self.pause().await;
        let schema = resources::schema(request.kind);
        for required in schema.required {
            match request.inputs.get(*required) {
                None | Some(Value::Null) => {
                    return Err(ProviderError::fatal(format!(
                        "{}: required input '{}' is empty",
                        request.address, required
                    )));
                }
                Some(_) => {}
            }
        }

        let ctx = SimContext {
            stack: &request.stack,
            address: &request.address,
            region: &request.region,
            inputs: &request.inputs,
            prior: request.prior.as_ref(),
        };
        Ok(resources::simulate(request.kind, &ctx))
    }

    async fn deprovision(&self, _request: &DeprovisionRequest) -> Result<(), ProviderError> {
        self.pause().await;
        Ok(())
    }
}
