//! Model switching

use serde::Serialize;
use std::collections::HashSet;
use tracing::{error, info};

use super::{Inner, OrchestratorError, Result};

/// Result of a model switch request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SwitchOutcome {
    /// The requested model was already active
    Unchanged { model: String },
    Switched {
        previous: Option<String>,
        current: String,
        /// Services restarted on the new model, in start order
        restarted: Vec<String>,
    },
}

impl Inner {
    pub(super) async fn switch_model(&self, model: &str) -> Result<SwitchOutcome> {
        let _switch = self.switch_lock.lock().await;

        let previous = {
            let models = self.models.read();
            if !models.contains(model) {
                return Err(OrchestratorError::UnknownModel(model.to_string()));
            }
            let current = models.active_id().map(String::from);
            if current.as_deref() == Some(model) {
                info!("Model {} already active", model);
                return Ok(SwitchOutcome::Unchanged {
                    model: model.to_string(),
                });
            }
            current
        };

        let affected = self.model_affected_services();
        let to_restart: Vec<String> = affected
            .iter()
            .rev()
            .filter(|id| self.is_active(id))
            .cloned()
            .collect();

        info!(
            "Switching model {} -> {} (stopping {:?}, restarting {:?})",
            previous.as_deref().unwrap_or("<none>"),
            model,
            affected,
            to_restart
        );

        let stopped = self.stop_in_order(&affected).await;

        // Recorded even when a stop failed, so the intended target is not lost
        self.models.write().set_active(model);
        self.persist();

        let switch_failed = |source: OrchestratorError| {
            error!("Model switch to {} failed: {}", model, source);
            OrchestratorError::ModelSwitchFailed {
                model: model.to_string(),
                source: Box::new(source),
            }
        };

        stopped.map_err(switch_failed)?;

        for id in &to_restart {
            self.start_one(id).await.map_err(switch_failed)?;
        }

        info!("Model switched to {}", model);
        Ok(SwitchOutcome::Switched {
            previous,
            current: model.to_string(),
            restarted: to_restart,
        })
    }

    /// Model-bound services plus everything depending on them, in stop order
    fn model_affected_services(&self) -> Vec<String> {
        let mut affected = HashSet::new();
        for (id, slot) in &self.slots {
            if slot.definition.uses_model() {
                affected.extend(self.graph.dependents_of(id));
            }
        }
        self.graph
            .stop_order()
            .iter()
            .filter(|id| affected.contains(*id))
            .cloned()
            .collect()
    }
}
