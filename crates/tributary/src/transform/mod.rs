//! Event transformation
//!
//! Three mutually exclusive modes, selected by configuration:
//! - disabled: identity pass-through
//! - rules: declarative per-table field rewriting ([`RuleSet`])
//! - script: an embedded ECMAScript program that may mutate, reject, or
//!   fan out events ([`ScriptTransformer`])
//!
//! `transform` returns `Ok(None)` when an event is rejected; the pipeline
//! drops it without publishing.

mod rules;
mod script;

pub use rules::{RuleSet, TransformRule};
pub use script::ScriptTransformer;

use crate::common::{CdcError, ChangeEvent, Result};
use crate::sink::ScriptBus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Transformer configuration. `script` and `rules` are mutually exclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub rules: Vec<TransformRule>,
}

/// The configured transformation stage.
#[derive(Debug)]
pub enum Transformer {
    Disabled,
    Rules(RuleSet),
    Script(ScriptTransformer),
}

impl Transformer {
    /// Build and validate from configuration. Script validation executes the
    /// source once in a throwaway runtime and fails fast on a bad shape.
    pub fn from_config(
        config: &TransformConfig,
        bus: Option<Arc<dyn ScriptBus>>,
    ) -> Result<Self> {
        if config.script.is_some() && !config.rules.is_empty() {
            return Err(CdcError::config(
                "transformer accepts either `script` or `rules`, not both",
            ));
        }

        if !config.enabled {
            return Ok(Transformer::Disabled);
        }

        if let Some(path) = &config.script {
            return Ok(Transformer::Script(ScriptTransformer::load(path, bus)?));
        }

        if !config.rules.is_empty() {
            return Ok(Transformer::Rules(RuleSet::compile(&config.rules)?));
        }

        Ok(Transformer::Disabled)
    }

    /// Apply the configured transformation. `Ok(None)` means the event was
    /// rejected and must not be published.
    pub fn transform(&self, event: ChangeEvent) -> Result<Option<ChangeEvent>> {
        match self {
            Transformer::Disabled => Ok(Some(event)),
            Transformer::Rules(rules) => Ok(Some(rules.apply(event))),
            Transformer::Script(script) => script.transform(&event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> ChangeEvent {
        let mut row = crate::common::Row::new();
        row.insert("id".into(), json!(1));
        ChangeEvent::insert("shop", "orders", vec![row], 0)
    }

    #[test]
    fn test_disabled_is_identity() {
        let transformer = Transformer::from_config(&TransformConfig::default(), None).unwrap();
        let event = sample_event();
        let out = transformer.transform(event.clone()).unwrap().unwrap();
        assert_eq!(out.rows, event.rows);
        assert_eq!(out.database, event.database);
    }

    #[test]
    fn test_enabled_without_script_or_rules_is_identity() {
        let config = TransformConfig {
            enabled: true,
            ..Default::default()
        };
        let transformer = Transformer::from_config(&config, None).unwrap();
        assert!(matches!(transformer, Transformer::Disabled));
    }

    #[test]
    fn test_script_and_rules_are_exclusive() {
        let config = TransformConfig {
            enabled: true,
            script: Some("/tmp/transform.js".into()),
            rules: vec![TransformRule::default()],
        };
        let err = Transformer::from_config(&config, None).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_script_and_rules_rejected_even_when_disabled() {
        let config = TransformConfig {
            enabled: false,
            script: Some("/tmp/transform.js".into()),
            rules: vec![TransformRule::default()],
        };
        assert!(Transformer::from_config(&config, None).is_err());
    }
}
