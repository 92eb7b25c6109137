//! Test helpers shared across Voyage crates: a scripted agent capability and
//! a few fixtures for booking runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use voyage_core::config::{AppConfig, StoreBackend};
use voyage_core::error::CapabilityError;
use voyage_core::traits::{AgentCapability, AgentInput};

type Validator<T> = Box<dyn Fn(&T) -> Result<(), String> + Send + Sync>;
type Hook = Box<dyn Fn(usize) + Send + Sync>;

/// Capability that replays a fixed script of results.
///
/// Call `n` returns the `n`th scripted result; once the script runs out the
/// last entry repeats. Every input is recorded for later inspection.
pub struct ScriptedCapability<T> {
    name: String,
    script: Vec<Result<T, CapabilityError>>,
    calls: AtomicUsize,
    inputs: Mutex<Vec<AgentInput>>,
    delay: Option<Duration>,
    timeout_secs: u64,
    validator: Option<Validator<T>>,
    on_invoke: Option<Hook>,
}

impl<T> ScriptedCapability<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(script: Vec<Result<T, CapabilityError>>) -> Self {
        Self {
            name: "scripted".to_string(),
            script,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
            delay: None,
            timeout_secs: 30,
            validator: None,
            on_invoke: None,
        }
    }

    /// Succeed with `value` on every call.
    pub fn always(value: T) -> Self {
        Self::new(vec![Ok(value)])
    }

    /// Fail retryably `failures` times, then succeed with `value`.
    pub fn failing_then(failures: usize, value: T) -> Self {
        let mut script: Vec<Result<T, CapabilityError>> = (1..=failures)
            .map(|n| Err(CapabilityError::retryable(format!("transient failure #{}", n))))
            .collect();
        script.push(Ok(value));
        Self::new(script)
    }

    /// Sleep before answering, to exercise timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_validator(
        mut self,
        validator: impl Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Run `hook` with the 1-based call number on every invocation.
    pub fn on_invoke(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_invoke = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_input(&self) -> Option<AgentInput> {
        self.inputs.lock().unwrap().last().cloned()
    }

    fn next_result(&self, call: usize) -> Result<T, CapabilityError> {
        match self.script.get(call - 1).or_else(|| self.script.last()) {
            Some(result) => result.clone(),
            None => Err(CapabilityError::fatal("empty script")),
        }
    }
}

impl<T> AgentCapability for ScriptedCapability<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, input: AgentInput) -> BoxFuture<'_, Result<T, CapabilityError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.inputs.lock().unwrap().push(input);
            if let Some(ref hook) = self.on_invoke {
                hook(call);
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.next_result(call)
        })
    }

    fn validate(&self, output: &T) -> Result<(), String> {
        match self.validator {
            Some(ref validator) => validator(output),
            None => Ok(()),
        }
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}

/// The reference booking request: SFO to JFK on 2024-05-01.
pub fn sample_request() -> serde_json::Value {
    serde_json::json!({
        "origin": "SFO",
        "destination": "JFK",
        "travel_date": "2024-05-01",
    })
}

/// Config with millisecond backoff and an in-memory store, for fast tests.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 10;
    config.store.backend = StoreBackend::Memory;
    config.log = None;
    config
}
