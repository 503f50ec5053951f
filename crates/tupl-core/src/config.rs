//! Engine configuration.
//!
//! Loaded from JSON (every field optional) and clamped by
//! [`EngineConfig::validated`] before a partition is built from it.

use std::path::Path;

use tupl_error::{Result, TuplError};
use tupl_interp::InterpLimits;
use tupl_types::LogGroupId;

/// Limits and switches of one partition context.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum physical tuple slots per partition.
    pub slot_pool_capacity: usize,
    pub slots_per_page: usize,
    /// Words per variable-area page.
    pub var_page_words: usize,
    pub var_page_limit: usize,
    /// Outstanding shadow copies allowed across all open operations.
    pub max_shadow_copies: usize,
    pub interpreter_max_instructions: u32,
    pub interpreter_call_depth: usize,
    /// Output budget used when a request does not carry one.
    pub default_output_budget_words: usize,
    /// Log group charged for undo reservations.
    pub undo_log_group: u32,
    /// Whether this partition delivers trigger events.
    pub primary_replica: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_pool_capacity: 65_536,
            slots_per_page: 128,
            var_page_words: 8_192,
            var_page_limit: 4_096,
            max_shadow_copies: 16_384,
            interpreter_max_instructions: 8_000,
            interpreter_call_depth: 32,
            default_output_budget_words: 8_192,
            undo_log_group: 1,
            primary_replica: true,
        }
    }
}

const MAX_SLOTS_PER_PAGE: usize = 1 << 16;
const MAX_VAR_PAGES: usize = u16::MAX as usize;

impl EngineConfig {
    /// Clamp every field into its supported range.
    #[must_use]
    pub fn validated(mut self) -> Self {
        let before = self.clone();
        self.slots_per_page = self.slots_per_page.clamp(1, MAX_SLOTS_PER_PAGE);
        self.slot_pool_capacity = self.slot_pool_capacity.max(1);
        self.var_page_words = self.var_page_words.max(16);
        self.var_page_limit = self.var_page_limit.clamp(1, MAX_VAR_PAGES);
        self.max_shadow_copies = self.max_shadow_copies.max(1);
        self.interpreter_max_instructions = self.interpreter_max_instructions.max(1);
        self.interpreter_call_depth = self.interpreter_call_depth.max(1);
        self.default_output_budget_words = self.default_output_budget_words.max(1);
        if self != before {
            tracing::warn!(requested = ?before, effective = ?self, "engine config clamped");
        }
        self
    }

    /// Parse JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str::<Self>(json)
            .map(Self::validated)
            .map_err(|e| TuplError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TuplError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn interp_limits(&self) -> InterpLimits {
        InterpLimits {
            max_instructions: self.interpreter_max_instructions,
            call_depth: self.interpreter_call_depth,
        }
    }

    #[inline]
    pub fn undo_group(&self) -> LogGroupId {
        LogGroupId::new(self.undo_log_group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.slot_pool_capacity, 65_536);
        assert_eq!(c.interp_limits().max_instructions, 8_000);
        assert!(c.primary_replica);
        assert_eq!(c.clone().validated(), c);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let c = EngineConfig::from_json_str(r#"{"slot_pool_capacity": 10, "primary_replica": false}"#)
            .unwrap();
        assert_eq!(c.slot_pool_capacity, 10);
        assert!(!c.primary_replica);
        assert_eq!(c.slots_per_page, 128);
    }

    #[test]
    fn test_validated_clamps() {
        let c = EngineConfig {
            slots_per_page: 0,
            var_page_limit: 1 << 20,
            interpreter_call_depth: 0,
            ..EngineConfig::default()
        }
        .validated();
        assert_eq!(c.slots_per_page, 1);
        assert_eq!(c.var_page_limit, 65_535);
        assert_eq!(c.interpreter_call_depth, 1);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        assert!(matches!(
            EngineConfig::from_json_str("{\"slots_per_page\": \"many\"}"),
            Err(TuplError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, r#"{{"max_shadow_copies": 4, "undo_log_group": 9}}"#).unwrap();
        let c = EngineConfig::load(f.path()).unwrap();
        assert_eq!(c.max_shadow_copies, 4);
        assert_eq!(c.undo_group(), LogGroupId::new(9));

        let missing = f.path().with_extension("absent");
        assert!(matches!(EngineConfig::load(&missing), Err(TuplError::Config(_))));
    }
}
