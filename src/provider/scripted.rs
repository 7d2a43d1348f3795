//! Scripted provider for engine tests: records every call, injects
//! failures and delays, and tracks peak concurrency.

use super::local::LocalProvider;
use super::{DeprovisionRequest, ProvisionRequest, ResourceProvider};
use crate::core::types::Attributes;
use crate::error::ProviderError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One recorded provider call.
#[derive(Debug, Clone)]
pub struct Call {
    pub operation: &'static str,
    pub stack: String,
    pub address: String,
    pub inputs: Attributes,
}

impl Call {
    /// `"<stack>/<address>"`
    pub fn target(&self) -> String {
        format!("{}/{}", self.stack, self.address)
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    sim: LocalProvider,
    calls: Mutex<Vec<Call>>,
    /// `start <target>` / `end <target>` markers in wall-clock order
    timeline: Mutex<Vec<String>>,
    /// Queued failures per `stack/address`, consumed one per call
    failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    /// Failures returned on every call
    always_fail: Mutex<HashMap<String, ProviderError>>,
    overrides: Mutex<HashMap<String, Attributes>>,
    delays: Mutex<HashMap<String, Duration>>,
    default_delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    /// Delay calls for one target only.
    pub fn delay(&self, target: &str, delay: Duration) {
        lock(&self.delays).insert(target.to_string(), delay);
    }

    /// Fail the next call for `target` with `err`.
    pub fn fail_once(&self, target: &str, err: ProviderError) {
        lock(&self.failures)
            .entry(target.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn fail_always(&self, target: &str, err: ProviderError) {
        lock(&self.always_fail).insert(target.to_string(), err);
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
        lock(&self.always_fail).clear();
    }

    /// Merge `attrs` over the simulated outputs of `target`.
    pub fn set_outputs(&self, target: &str, attrs: Attributes) {
        lock(&self.overrides).insert(target.to_string(), attrs);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    /// Targets of recorded calls for one operation, in call order.
    pub fn targets(&self, operation: &str) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation)
            .map(Call::target)
            .collect()
    }

    pub fn timeline(&self) -> Vec<String> {
        lock(&self.timeline).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
        lock(&self.timeline).clear();
        self.peak.store(0, Ordering::SeqCst);
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn enter(&self, operation: &'static str, stack: &str, address: &str, inputs: &Attributes) -> Result<(), ProviderError> {
        let target = format!("{}/{}", stack, address);
        lock(&self.calls).push(Call {
            operation,
            stack: stack.to_string(),
            address: address.to_string(),
            inputs: inputs.clone(),
        });

        lock(&self.timeline).push(format!("start {}", target));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = lock(&self.delays).get(&target).copied().or(self.default_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.timeline).push(format!("end {}", target));

        if let Some(err) = lock(&self.always_fail).get(&target).cloned() {
            return Err(err);
        }
        if let Some(err) = lock(&self.failures)
            .get_mut(&target)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ResourceProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<Attributes, ProviderError> {
        self.enter("provision", &request.stack, &request.address, &request.inputs)
            .await?;
        let mut out = self.sim.provision(request).await?;
        let target = format!("{}/{}", request.stack, request.address);
        if let Some(extra) = lock(&self.overrides).get(&target) {
            for (k, v) in extra {
                out.insert(k.clone(), v.clone());
            }
        }
        Ok(out)
    }

    async fn deprovision(&self, request: &DeprovisionRequest) -> Result<(), ProviderError> {
        self.enter("deprovision", &request.stack, &request.address, &request.outputs)
            .await
    }
}
