//! Runtime Config (spec §3): a small, atomically-replaced mapping persisted as a
//! single opaque blob through Storage, under settings key `brain.config.v1`.

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPolicy {
    Auto,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsScope {
    User,
    App,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub enabled: bool,
    pub auto_start: bool,
    pub provider_url: String,
    pub model: String,
    pub api_key_credential: String,
    pub api_key_env: Option<String>,
    pub tool_policy: ToolPolicy,
    pub fs_scope: FsScope,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_actions: u32,
    pub max_tool_rounds: u32,
    pub idle_sleep_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_start: false,
            provider_url: "https://api.openai.com/v1/responses".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_credential: "openai_api_key".to_string(),
            api_key_env: None,
            tool_policy: ToolPolicy::Auto,
            fs_scope: FsScope::User,
            system_prompt:
                "You are the on-device agent for this machine. You may run python, pip, and curl, \
                 inspect and edit files under the user's workspace, and call the device API when asked. \
                 Prefer the fewest tool calls that accomplish the task."
                    .to_string(),
            temperature: 0.2,
            max_actions: 6,
            max_tool_rounds: 8,
            idle_sleep_ms: 800,
        }
    }
}

impl RuntimeConfig {
    /// Clamp fields to the ranges spec §3 requires, after loading or merging a
    /// partial update.
    pub fn clamped(mut self) -> Self {
        self.max_actions = self.max_actions.clamp(1, 12);
        self.max_tool_rounds = self.max_tool_rounds.clamp(1, 24);
        self.idle_sleep_ms = self.idle_sleep_ms.max(100);
        self
    }

    pub fn uses_tool_loop_protocol(&self) -> bool {
        self.provider_url.ends_with("/responses")
    }

    const SETTINGS_KEY: &'static str = "brain.config.v1";

    pub fn load(storage: &Storage) -> Result<Self> {
        match storage.get_setting(Self::SETTINGS_KEY)? {
            Some(raw) => Ok(serde_json::from_str::<Self>(&raw).unwrap_or_default().clamped()),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, storage: &Storage) -> Result<()> {
        let raw = serde_json::to_string(self).expect("RuntimeConfig serializes");
        storage.set_setting(Self::SETTINGS_KEY, &raw)?;
        Ok(())
    }

    /// Apply a partial JSON patch (as received from `POST /brain/config`) atomically:
    /// last-write-wins over the currently persisted config.
    pub fn merge_patch(&self, patch: &serde_json::Value) -> Self {
        let mut current = serde_json::to_value(self).expect("RuntimeConfig serializes");
        if let (Some(base), Some(patch_obj)) = (current.as_object_mut(), patch.as_object()) {
            for (k, v) in patch_obj {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value::<Self>(current).unwrap_or_else(|_| self.clone()).clamped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_tool_loop_protocol() {
        assert!(RuntimeConfig::default().uses_tool_loop_protocol());
    }

    #[test]
    fn clamped_bounds_are_enforced() {
        let config = RuntimeConfig { max_actions: 99, max_tool_rounds: 0, idle_sleep_ms: 0, ..RuntimeConfig::default() }.clamped();
        assert_eq!(config.max_actions, 12);
        assert_eq!(config.max_tool_rounds, 1);
        assert_eq!(config.idle_sleep_ms, 100);
    }

    #[test]
    fn save_and_load_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        let mut config = RuntimeConfig::default();
        config.model = "custom-model".to_string();
        config.save(&storage).unwrap();
        let loaded = RuntimeConfig::load(&storage).unwrap();
        assert_eq!(loaded.model, "custom-model");
    }

    #[test]
    fn merge_patch_overrides_only_named_fields() {
        let config = RuntimeConfig::default();
        let patched = config.merge_patch(&serde_json::json!({"model": "gpt-5", "max_actions": 3}));
        assert_eq!(patched.model, "gpt-5");
        assert_eq!(patched.max_actions, 3);
        assert_eq!(patched.system_prompt, config.system_prompt);
    }
}
