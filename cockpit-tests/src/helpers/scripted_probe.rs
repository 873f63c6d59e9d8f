//! Health probe with test-controlled outcomes

use async_trait::async_trait;
use cockpit_daemon::health::{HealthProbe, ProbeOutcome};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Answers from a script first, then with a switchable default outcome
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeOutcome>>,
    default: Mutex<ProbeOutcome>,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn new(script: Vec<ProbeOutcome>, default: ProbeOutcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            default: Mutex::new(default),
            calls: AtomicU32::new(0),
        })
    }

    pub fn always_healthy() -> Arc<Self> {
        Self::new(Vec::new(), ProbeOutcome::Healthy)
    }

    pub fn always_unhealthy() -> Arc<Self> {
        Self::new(Vec::new(), failure())
    }

    /// Change the answer given once the script is exhausted
    pub fn set_healthy(&self, healthy: bool) {
        *self.default.lock() = if healthy { ProbeOutcome::Healthy } else { failure() };
    }

    /// Number of probes issued so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn failure() -> ProbeOutcome {
    ProbeOutcome::Unhealthy("scripted failure".to_string())
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, _url: &str, _timeout: Duration) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.default.lock().clone())
    }
}
