//! Model variant configuration

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A scalar config value kept as text (YAML numbers and booleans are accepted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ScalarString(pub String);

impl<'de> Deserialize<'de> for ScalarString {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde_yaml::Value;
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(ScalarString(s)),
            Value::Number(n) => Ok(ScalarString(n.to_string())),
            Value::Bool(b) => Ok(ScalarString(b.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "expected a string, number or boolean, got {:?}",
                other
            ))),
        }
    }
}

impl From<&str> for ScalarString {
    fn from(s: &str) -> Self {
        ScalarString(s.to_string())
    }
}

/// One selectable model variant and its resource profile
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelVariant {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_utilization: Option<ScalarString>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, ScalarString>,
}

impl ModelVariant {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            gpu_memory_utilization: None,
            params: BTreeMap::new(),
        }
    }

    /// Last path segment of the id (`org/model` -> `model`).
    pub fn short_name(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }

    /// Human-readable label
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.short_name())
    }

    /// Value for a template placeholder, if this variant provides one.
    pub fn template_value(&self, key: &str) -> Option<String> {
        match key {
            "model" => Some(self.id.clone()),
            "model_short" => Some(self.short_name().to_string()),
            "gpu_memory_utilization" => self.gpu_memory_utilization.as_ref().map(|v| v.0.clone()),
            other => self.params.get(other).map(|v| v.0.clone()),
        }
    }

    /// All placeholder values this variant provides.
    pub fn template_vars(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("model".to_string(), self.id.clone());
        vars.insert("model_short".to_string(), self.short_name().to_string());
        if let Some(gpu) = &self.gpu_memory_utilization {
            vars.insert("gpu_memory_utilization".to_string(), gpu.0.clone());
        }
        for (key, value) in &self.params {
            vars.insert(key.clone(), value.0.clone());
        }
        vars
    }
}

/// Available model variants plus the single active selection
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Default selection; the first variant when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
    #[serde(default)]
    pub variants: Vec<ModelVariant>,
}

impl ModelConfig {
    pub fn get(&self, id: &str) -> Option<&ModelVariant> {
        self.variants.iter().find(|v| v.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active
            .as_deref()
            .or_else(|| self.variants.first().map(|v| v.id.as_str()))
    }

    pub fn active_variant(&self) -> Option<&ModelVariant> {
        self.active_id().and_then(|id| self.get(id))
    }

    /// Record a new selection. Returns false if the id is unknown.
    pub fn set_active(&mut self, id: &str) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.active = Some(id.to_string());
        true
    }

    /// Placeholder values for the active variant (empty when no models are configured).
    pub fn active_vars(&self) -> HashMap<String, String> {
        self.active_variant()
            .map(ModelVariant::template_vars)
            .unwrap_or_default()
    }
}
