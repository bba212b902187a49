// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! Label-match filter processor.

use plugin::{ConfigMap, OutputPacket, Plugin, PluginError, Processor, Reconfigure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterAction {
    Drop,
    Keep,
}

/// Drops (or keeps only) records whose label equals a configured value.
///
/// Options: `label` (key to inspect), `equals` (value to compare), `action`
/// (`drop` to discard matches, `keep` to discard everything else).
pub struct FilterProcessor {
    label: String,
    equals: String,
    action: FilterAction,
}

impl Default for FilterProcessor {
    fn default() -> Self {
        Self {
            label: String::new(),
            equals: String::new(),
            action: FilterAction::Drop,
        }
    }
}

impl FilterProcessor {
    fn apply(&mut self, cfg: &ConfigMap) -> Result<(), PluginError> {
        let get = |key: &str| {
            cfg.get(key)
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned)
        };
        self.label = get("label").ok_or_else(|| PluginError::InitFailed {
            name: "filter".to_owned(),
            reason: "'label' option is required".to_owned(),
        })?;
        self.equals = get("equals").ok_or_else(|| PluginError::InitFailed {
            name: "filter".to_owned(),
            reason: "'equals' option is required".to_owned(),
        })?;
        self.action = match get("action").as_deref() {
            None | Some("drop") => FilterAction::Drop,
            Some("keep") => FilterAction::Keep,
            Some(other) => {
                return Err(PluginError::InitFailed {
                    name: "filter".to_owned(),
                    reason: format!("'action' must be drop or keep, got '{other}'"),
                });
            }
        };
        Ok(())
    }
}

impl Plugin for FilterProcessor {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn init(&mut self, cfg: &ConfigMap) -> Result<(), PluginError> {
        self.apply(cfg)
    }
}

impl Processor for FilterProcessor {
    fn process(&mut self, pkt: &mut OutputPacket) -> bool {
        let matched = pkt.labels.get(&self.label) == self.equals;
        match self.action {
            FilterAction::Drop => !matched,
            FilterAction::Keep => matched,
        }
    }

    fn as_reconfigurable(&mut self) -> Option<&mut dyn Reconfigure> {
        Some(self)
    }
}

impl Reconfigure for FilterProcessor {
    fn reconfigure(&mut self, cfg: &ConfigMap) -> Result<(), PluginError> {
        self.apply(cfg)
    }
}
