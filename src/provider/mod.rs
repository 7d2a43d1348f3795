//! Resource providers: the collaborators that create, update and delete
//! the objects a node describes.
//!
//! The engine only ever talks to a [`ResourceProvider`]. Two ship with the
//! crate: [`local::LocalProvider`], a deterministic simulator, and
//! [`command::CommandProvider`], which delegates to an external plugin.

pub mod command;
pub mod local;
#[cfg(test)]
pub mod scripted;

use crate::core::types::{Attributes, ResourceKind};
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Create-or-update request for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub stack: String,
    pub region: String,
    pub address: String,
    pub kind: ResourceKind,
    /// Fully resolved inputs; no tokens remain
    pub inputs: Attributes,
    /// Outputs from the last successful provision, if any
    #[serde(default)]
    pub prior: Option<Attributes>,
}

/// Removal request for one recorded node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeprovisionRequest {
    pub stack: String,
    pub region: String,
    pub address: String,
    pub kind: ResourceKind,
    /// Last-known outputs from the state record
    pub outputs: Attributes,
}

#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Create or update the object and report its attributes.
    async fn provision(&self, request: &ProvisionRequest) -> Result<Attributes, ProviderError>;

    /// Remove the object.
    async fn deprovision(&self, request: &DeprovisionRequest) -> Result<(), ProviderError>;
}
