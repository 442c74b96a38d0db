use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::ai::controller::BotSettings;
use crate::ai::perception::PerceptionConfig;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be {expected}, got {value}")]
    Invalid {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Bot AI configuration
#[derive(Debug, Clone)]
pub struct AiConfig {
    /// Gates all AI ticking
    pub enabled: bool,
    /// Initial skill for new bots (0..1)
    pub skill: f32,
    /// Create learning agents for new bots
    pub learning: bool,
    /// Squad assignment and team coordination
    pub teamplay: bool,
    /// Per-bot re-evaluation interval
    pub think_time_ms: u64,
    pub vision_range: f32,
    pub fov_degrees: f32,
    /// Think bots on the rayon pool
    pub parallel_think: bool,
    pub debug_cover: bool,
    pub debug_movement: bool,
    pub debug_combat: bool,
    /// Directory of character JSON files
    pub character_dir: Option<PathBuf>,
    /// Directory for skill profiles and network checkpoints
    pub profile_dir: Option<PathBuf>,
    /// Seed for per-bot random streams
    pub seed: u64,
    /// Bots spawned by the headless runner
    pub bot_count: usize,
    /// Simulated match length for the headless runner
    pub match_seconds: f32,
    pub metrics_port: u16,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            skill: 0.5,
            learning: false,
            teamplay: true,
            think_time_ms: 50,
            vision_range: 2000.0,
            fov_degrees: 90.0,
            parallel_think: false,
            debug_cover: false,
            debug_movement: false,
            debug_combat: false,
            character_dir: None,
            profile_dir: None,
            seed: 0,
            bot_count: 6,
            match_seconds: 60.0,
            metrics_port: 9090,
        }
    }
}

/// Parse an env var, warning and returning `None` when it does not parse
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

impl AiConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_bool("AI_ENABLED") {
            config.enabled = v;
        }
        if let Some(skill) = env_parse::<f32>("AI_SKILL") {
            if (0.0..=1.0).contains(&skill) {
                config.skill = skill;
            } else {
                tracing::warn!("AI_SKILL must be 0-1, using default");
            }
        }
        if let Some(v) = env_bool("AI_LEARNING") {
            config.learning = v;
        }
        if let Some(v) = env_bool("AI_TEAMPLAY") {
            config.teamplay = v;
        }
        if let Some(ms) = env_parse::<u64>("AI_THINK_TIME_MS") {
            if ms > 0 && ms <= 1000 {
                config.think_time_ms = ms;
            } else {
                tracing::warn!("AI_THINK_TIME_MS must be 1-1000, using default");
            }
        }
        if let Some(range) = env_parse::<f32>("AI_VISION_RANGE") {
            config.vision_range = range;
        }
        if let Some(fov) = env_parse::<f32>("AI_FOV") {
            config.fov_degrees = fov;
        }
        if let Some(v) = env_bool("AI_PARALLEL_THINK") {
            config.parallel_think = v;
        }
        if let Some(v) = env_bool("AI_DEBUG_COVER") {
            config.debug_cover = v;
        }
        if let Some(v) = env_bool("AI_DEBUG_MOVEMENT") {
            config.debug_movement = v;
        }
        if let Some(v) = env_bool("AI_DEBUG_COMBAT") {
            config.debug_combat = v;
        }
        if let Ok(dir) = std::env::var("AI_CHARACTER_DIR") {
            config.character_dir = Some(PathBuf::from(dir));
        }
        if let Ok(dir) = std::env::var("AI_PROFILE_DIR") {
            config.profile_dir = Some(PathBuf::from(dir));
        }
        if let Some(seed) = env_parse("AI_SEED") {
            config.seed = seed;
        }
        if let Some(count) = env_parse("AI_BOTS") {
            config.bot_count = count;
        }
        if let Some(secs) = env_parse("AI_MATCH_SECONDS") {
            config.match_seconds = secs;
        }
        if let Some(port) = env_parse("METRICS_PORT") {
            config.metrics_port = port;
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, expected, value: String| ConfigError::Invalid { field, expected, value };
        if !(0.0..=1.0).contains(&self.skill) {
            return Err(invalid("skill", "within 0-1", self.skill.to_string()));
        }
        if self.think_time_ms == 0 {
            return Err(invalid("think_time_ms", "at least 1", "0".to_string()));
        }
        if !(self.vision_range > 0.0) {
            return Err(invalid("vision_range", "positive", self.vision_range.to_string()));
        }
        if !(self.fov_degrees > 0.0 && self.fov_degrees <= 360.0) {
            return Err(invalid("fov_degrees", "within 0-360", self.fov_degrees.to_string()));
        }
        if self.bot_count > crate::ai::constants::bot::MAX_CLIENTS {
            return Err(invalid("bot_count", "at most 64", self.bot_count.to_string()));
        }
        if !(self.match_seconds > 0.0) {
            return Err(invalid("match_seconds", "positive", self.match_seconds.to_string()));
        }
        Ok(())
    }

    pub fn think_interval(&self) -> f32 {
        self.think_time_ms as f32 / 1000.0
    }

    /// Per-bot settings for newly spawned bots
    pub fn bot_settings(&self) -> BotSettings {
        BotSettings {
            think_interval: self.think_interval(),
            learning: self.learning,
            perception: PerceptionConfig {
                vision_range: self.vision_range,
                fov_degrees: self.fov_degrees,
                ..PerceptionConfig::default()
            },
            debug_cover: self.debug_cover,
            debug_movement: self.debug_movement,
            debug_combat: self.debug_combat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AiConfig::default();
        assert!(config.enabled);
        assert!(config.teamplay);
        assert!(!config.learning);
        assert_eq!(config.think_time_ms, 50);
        assert!((config.think_interval() - 0.05).abs() < 1e-6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = AiConfig::load_or_default();
        assert!(config.think_time_ms > 0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = AiConfig {
            skill: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "skill", .. })));

        let config = AiConfig {
            fov_degrees: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AiConfig {
            bot_count: 65,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bot_settings_carry_perception() {
        let config = AiConfig {
            vision_range: 1234.0,
            fov_degrees: 120.0,
            think_time_ms: 100,
            debug_cover: true,
            ..Default::default()
        };
        let settings = config.bot_settings();
        assert_eq!(settings.perception.vision_range, 1234.0);
        assert_eq!(settings.perception.fov_degrees, 120.0);
        assert!((settings.think_interval - 0.1).abs() < 1e-6);
        assert!(settings.debug_cover);
    }
}
