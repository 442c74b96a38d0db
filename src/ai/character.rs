//! Bot characters: personality plus the handful of numbers a character
//! file can override. Files are JSON, one per character, named
//! `<name>.json` in the character directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ai::combat::CombatStyle;
use crate::ai::controller::Goals;
use crate::ai::movement::MovementStyle;
use crate::ai::team::Role;
use crate::ai::weapons::Weapon;

#[derive(Error, Debug)]
pub enum CharacterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid character {name}: {reason}")]
    Invalid { name: String, reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Personality {
    Aggressive,
    Defensive,
    Tactical,
    Sniper,
    Rusher,
    Support,
    Guerrilla,
    #[default]
    Balanced,
}

impl Personality {
    pub const ALL: [Personality; 8] = [
        Personality::Aggressive,
        Personality::Defensive,
        Personality::Tactical,
        Personality::Sniper,
        Personality::Rusher,
        Personality::Support,
        Personality::Guerrilla,
        Personality::Balanced,
    ];

    pub fn combat_style(self) -> CombatStyle {
        match self {
            Personality::Aggressive => CombatStyle::Aggressive,
            Personality::Defensive => CombatStyle::Defensive,
            Personality::Tactical => CombatStyle::Balanced,
            Personality::Sniper => CombatStyle::Sniper,
            Personality::Rusher => CombatStyle::Rusher,
            Personality::Support => CombatStyle::Support,
            Personality::Guerrilla => CombatStyle::Guerrilla,
            Personality::Balanced => CombatStyle::Balanced,
        }
    }

    pub fn movement_style(self) -> MovementStyle {
        match self {
            Personality::Aggressive | Personality::Rusher => MovementStyle::Aggressive,
            Personality::Defensive | Personality::Support => MovementStyle::Standard,
            Personality::Tactical | Personality::Sniper => MovementStyle::Tactical,
            Personality::Guerrilla => MovementStyle::Evasive,
            Personality::Balanced => MovementStyle::Standard,
        }
    }

    pub fn role(self) -> Role {
        match self {
            Personality::Aggressive | Personality::Balanced => Role::Assault,
            Personality::Defensive => Role::Heavy,
            Personality::Support => Role::Support,
            Personality::Sniper => Role::Sniper,
            Personality::Rusher | Personality::Guerrilla | Personality::Tactical => Role::Scout,
        }
    }

    /// Starting goal weights
    pub fn goals(self) -> Goals {
        let g = |combat, item, exploration, objective| Goals {
            combat,
            item,
            exploration,
            objective,
        };
        match self {
            Personality::Aggressive => g(0.9, 0.4, 0.5, 0.4),
            Personality::Defensive => g(0.5, 0.6, 0.2, 0.7),
            Personality::Tactical => g(0.6, 0.5, 0.4, 0.8),
            Personality::Sniper => g(0.7, 0.4, 0.3, 0.5),
            Personality::Rusher => g(1.0, 0.3, 0.6, 0.3),
            Personality::Support => g(0.4, 0.7, 0.3, 0.8),
            Personality::Guerrilla => g(0.7, 0.5, 0.7, 0.4),
            Personality::Balanced => g(0.6, 0.5, 0.5, 0.5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterProfile {
    pub name: String,
    /// 0..1
    pub skill: f32,
    pub personality: Personality,
    /// Seconds
    pub reaction_time: f32,
    /// 0..1
    pub aim_accuracy: f32,
    pub preferred_weapon: Option<Weapon>,
}

impl Default for CharacterProfile {
    fn default() -> Self {
        Self::builtin("bot", 0.5)
    }
}

impl CharacterProfile {
    /// Built-in profile used when no file is available
    pub fn builtin(name: &str, skill: f32) -> Self {
        let skill = skill.clamp(0.0, 1.0);
        Self {
            name: name.to_string(),
            skill,
            personality: Personality::Balanced,
            reaction_time: 0.5 - 0.35 * skill,
            aim_accuracy: 0.3 + 0.6 * skill,
            preferred_weapon: None,
        }
    }

    /// Built-in roster cycled by the headless runner
    pub fn roster(index: usize, skill: f32) -> Self {
        const NAMES: [&str; 8] = ["Brute", "Warden", "Cipher", "Hawk", "Blitz", "Medic", "Ghost", "Drifter"];
        let slot = index % NAMES.len();
        Self {
            personality: Personality::ALL[slot],
            ..Self::builtin(NAMES[slot], skill)
        }
    }

    pub fn file_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.json", name.to_lowercase()))
    }

    pub fn load(path: &Path) -> Result<Self, CharacterError> {
        let text = std::fs::read_to_string(path)?;
        let profile: CharacterProfile = serde_json::from_str(&text)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn save(&self, path: &Path) -> Result<(), CharacterError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), CharacterError> {
        let invalid = |reason| CharacterError::Invalid {
            name: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("empty name"));
        }
        if !(0.0..=1.0).contains(&self.skill) {
            return Err(invalid("skill outside 0..1"));
        }
        if !(0.0..=1.0).contains(&self.aim_accuracy) {
            return Err(invalid("aim accuracy outside 0..1"));
        }
        if !self.reaction_time.is_finite() || self.reaction_time < 0.0 {
            return Err(invalid("negative reaction time"));
        }
        Ok(())
    }

    /// Load `<dir>/<name>.json`, falling back to the built-in profile when
    /// there is no directory, no file, or a bad file
    pub fn load_or_default(dir: Option<&Path>, name: &str, skill: f32) -> Self {
        let Some(dir) = dir else {
            return Self::builtin(name, skill);
        };
        let path = Self::file_path(dir, name);
        match Self::load(&path) {
            Ok(profile) => {
                debug!(name, path = %path.display(), "Character loaded");
                profile
            }
            Err(CharacterError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::builtin(name, skill),
            Err(e) => {
                warn!(name, path = %path.display(), error = %e, "Bad character file, using built-in profile");
                Self::builtin(name, skill)
            }
        }
    }
}
