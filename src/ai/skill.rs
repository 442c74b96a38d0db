//! Dynamic difficulty
//!
//! Each bot carries a [`SkillProfile`] (aggregate skill plus seven component
//! skills) and an [`AdaptationState`] describing how its opponents are doing
//! against it. Every adjustment interval the profile's target skill moves
//! toward a win rate slightly under 50% for the bot, pushed down by opponent
//! frustration and up by opponent boredom. The visible skill then ramps
//! toward the target at a bounded rate.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ai::constants::skill::{
    ADJUST_INTERVAL, AIM_RATE, DEFAULT_LEARNING_RATE, DEFAULT_MAX_SKILL, DEFAULT_MIN_SKILL,
    DEFAULT_MOMENTUM, HISTORY_WINDOW, INTERPOLATION_RATE, MOVEMENT_RATE, PREDICTION_RATE,
    REACTION_RATE, RESOURCE_RATE, TACTICAL_RATE, TARGET_WIN_RATE, TEAMWORK_RATE,
};
use crate::util::ring::RingBuffer;

/// Errors from skill profile persistence
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Tracked performance metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    Accuracy,
    KillDeathRatio,
    DamageRatio,
    /// Seconds, lower is better
    ReactionTime,
    SurvivalTime,
    ObjectiveScore,
    MovementEfficiency,
}

pub const METRIC_KIND_COUNT: usize = 7;

impl MetricKind {
    pub const ALL: [MetricKind; METRIC_KIND_COUNT] = [
        MetricKind::Accuracy,
        MetricKind::KillDeathRatio,
        MetricKind::DamageRatio,
        MetricKind::ReactionTime,
        MetricKind::SurvivalTime,
        MetricKind::ObjectiveScore,
        MetricKind::MovementEfficiency,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    fn higher_is_better(self) -> bool {
        self != MetricKind::ReactionTime
    }
}

/// Fixed window of samples with cached moving average and variance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricHistory {
    samples: RingBuffer<f32>,
    average: f32,
    variance: f32,
}

impl Default for MetricHistory {
    fn default() -> Self {
        Self {
            samples: RingBuffer::new(HISTORY_WINDOW),
            average: 0.0,
            variance: 0.0,
        }
    }
}

impl MetricHistory {
    /// Insert a sample and recompute the statistics over the window
    pub fn push(&mut self, value: f32) {
        if !value.is_finite() {
            return;
        }
        self.samples.push(value);
        self.average = self.samples.mean();
        self.variance = self.samples.variance();
    }

    pub fn average(&self) -> f32 {
        self.average
    }

    pub fn variance(&self) -> f32 {
        self.variance
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<f32> {
        self.samples.newest().copied()
    }
}

/// One history per metric kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMetrics {
    histories: [MetricHistory; METRIC_KIND_COUNT],
}

impl Default for SkillMetrics {
    fn default() -> Self {
        Self {
            histories: std::array::from_fn(|_| MetricHistory::default()),
        }
    }
}

impl SkillMetrics {
    pub fn update(&mut self, kind: MetricKind, value: f32) {
        self.histories[kind.index()].push(value);
    }

    pub fn history(&self, kind: MetricKind) -> &MetricHistory {
        &self.histories[kind.index()]
    }

    pub fn average(&self, kind: MetricKind) -> f32 {
        self.histories[kind.index()].average()
    }

    /// Mean variance over kinds with at least `min_samples` samples
    pub fn mean_variance(&self, min_samples: usize) -> Option<f32> {
        let (sum, n) = self
            .histories
            .iter()
            .filter(|h| h.len() >= min_samples)
            .fold((0.0, 0usize), |(s, n), h| (s + h.variance(), n + 1));
        (n > 0).then(|| sum / n as f32)
    }
}

/// Component skills, each in `[min_skill, max_skill]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkillComponents {
    pub aim: f32,
    pub movement: f32,
    pub tactical: f32,
    pub reaction: f32,
    pub prediction: f32,
    pub resource_management: f32,
    pub teamwork: f32,
}

impl SkillComponents {
    pub fn splat(value: f32) -> Self {
        Self {
            aim: value,
            movement: value,
            tactical: value,
            reaction: value,
            prediction: value,
            resource_management: value,
            teamwork: value,
        }
    }

    pub fn values(&self) -> [f32; 7] {
        [
            self.aim,
            self.movement,
            self.tactical,
            self.reaction,
            self.prediction,
            self.resource_management,
            self.teamwork,
        ]
    }

    pub fn average(&self) -> f32 {
        self.values().iter().sum::<f32>() / 7.0
    }

    /// Nudge each component by `delta` scaled by its own rate, then clamp
    fn nudge(&mut self, delta: f32, min: f32, max: f32) {
        let step = |v: &mut f32, rate: f32| *v = (*v + delta * rate).clamp(min, max);
        step(&mut self.reaction, REACTION_RATE);
        step(&mut self.aim, AIM_RATE);
        step(&mut self.prediction, PREDICTION_RATE);
        step(&mut self.movement, MOVEMENT_RATE);
        step(&mut self.tactical, TACTICAL_RATE);
        step(&mut self.resource_management, RESOURCE_RATE);
        step(&mut self.teamwork, TEAMWORK_RATE);
    }
}

/// Per-bot difficulty profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillProfile {
    pub base_skill: f32,
    /// What the bot plays at right now
    pub current_skill: f32,
    /// Where adaptation wants the bot to be
    pub target_skill: f32,
    pub skill_velocity: f32,
    pub components: SkillComponents,
    pub learning_rate: f32,
    pub momentum: f32,
    /// Grows with the number of adjustments made on real data
    pub confidence: f32,
    pub min_skill: f32,
    pub max_skill: f32,
    /// Opponent performance minus bot performance
    pub performance_gap: f32,
    /// Smoothed change of the gap
    pub performance_trend: f32,
    pub player_metrics: SkillMetrics,
    pub bot_metrics: SkillMetrics,
    pub last_adjustment: Option<f32>,
    pub adjustments: u32,
}

impl SkillProfile {
    pub fn new(initial_skill: f32) -> Self {
        let skill = initial_skill.clamp(DEFAULT_MIN_SKILL, DEFAULT_MAX_SKILL);
        Self {
            base_skill: skill,
            current_skill: skill,
            target_skill: skill,
            skill_velocity: 0.0,
            components: SkillComponents::splat(skill),
            learning_rate: DEFAULT_LEARNING_RATE,
            momentum: DEFAULT_MOMENTUM,
            confidence: 0.0,
            min_skill: DEFAULT_MIN_SKILL,
            max_skill: DEFAULT_MAX_SKILL,
            performance_gap: 0.0,
            performance_trend: 0.0,
            player_metrics: SkillMetrics::default(),
            bot_metrics: SkillMetrics::default(),
            last_adjustment: None,
            adjustments: 0,
        }
    }

    /// Record one sample of a metric for both sides and refresh gap and trend
    pub fn update_metrics(&mut self, kind: MetricKind, player_value: f32, bot_value: f32) {
        self.player_metrics.update(kind, player_value);
        self.bot_metrics.update(kind, bot_value);

        let mut gap = 0.0;
        let mut kinds = 0;
        for kind in MetricKind::ALL {
            if self.player_metrics.history(kind).is_empty() || self.bot_metrics.history(kind).is_empty() {
                continue;
            }
            let diff = self.player_metrics.average(kind) - self.bot_metrics.average(kind);
            gap += if kind.higher_is_better() { diff } else { -diff };
            kinds += 1;
        }
        if kinds > 0 {
            let gap = gap / kinds as f32;
            self.performance_trend = 0.8 * self.performance_trend + 0.2 * (gap - self.performance_gap);
            self.performance_gap = gap;
        }
    }

    /// Ramp the visible skill toward the target without jumping
    pub fn interpolate_level(&mut self, dt: f32) {
        let max_step = INTERPOLATION_RATE * dt.max(0.0);
        let diff = self.target_skill - self.current_skill;
        self.current_skill += diff.clamp(-max_step, max_step);
        self.current_skill = self.current_skill.clamp(self.min_skill, self.max_skill);
    }

    /// Seconds the bot waits before reacting to a new threat
    pub fn reaction_delay(&self) -> f32 {
        0.5 - 0.4 * self.components.reaction.clamp(0.0, 1.0)
    }

    /// Effective aim accuracy, tempered by the visible skill
    pub fn aim_accuracy(&self) -> f32 {
        (self.components.aim * (0.5 + 0.5 * self.current_skill)).clamp(0.05, 1.0)
    }

    pub fn save(&self, path: &Path) -> Result<(), ProfileError> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let bytes = std::fs::read(path)?;
        let (profile, _): (SkillProfile, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(profile)
    }

    /// Load a saved profile, falling back to a fresh one at `initial_skill`
    pub fn load_or_new(path: &Path, initial_skill: f32) -> Self {
        match Self::load(path) {
            Ok(profile) => profile.sanitized(),
            Err(ProfileError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::new(initial_skill),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load skill profile, using defaults");
                Self::new(initial_skill)
            }
        }
    }

    /// Restore bounds after loading data that may have been edited by hand
    fn sanitized(mut self) -> Self {
        if !(self.min_skill.is_finite() && self.max_skill.is_finite()) || self.min_skill > self.max_skill {
            self.min_skill = DEFAULT_MIN_SKILL;
            self.max_skill = DEFAULT_MAX_SKILL;
        }
        let (lo, hi) = (self.min_skill, self.max_skill);
        let fix = |v: f32| if v.is_finite() { v.clamp(lo, hi) } else { lo };
        self.base_skill = fix(self.base_skill);
        self.current_skill = fix(self.current_skill);
        self.target_skill = fix(self.target_skill);
        self.components = SkillComponents {
            aim: fix(self.components.aim),
            movement: fix(self.components.movement),
            tactical: fix(self.components.tactical),
            reaction: fix(self.components.reaction),
            prediction: fix(self.components.prediction),
            resource_management: fix(self.components.resource_management),
            teamwork: fix(self.components.teamwork),
        };
        // A loaded profile starts a fresh adjustment interval
        self.last_adjustment = None;
        self
    }
}

/// How the bot's opponents are doing against it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationState {
    pub recent_kd_ratio: f32,
    pub recent_accuracy: f32,
    /// Consecutive opponent deaths without a kill
    pub death_streak: u32,
    pub kill_streak: u32,
    pub opponent_kills: u32,
    pub opponent_deaths: u32,
    pub opponent_shots: u32,
    pub opponent_hits: u32,
    /// Rounds the bot won / lost
    pub wins: u32,
    pub losses: u32,
    pub frustration: f32,
    pub boredom: f32,
}

impl Default for AdaptationState {
    fn default() -> Self {
        Self {
            recent_kd_ratio: 1.0,
            recent_accuracy: 0.3,
            death_streak: 0,
            kill_streak: 0,
            opponent_kills: 0,
            opponent_deaths: 0,
            opponent_shots: 0,
            opponent_hits: 0,
            wins: 0,
            losses: 0,
            frustration: 0.0,
            boredom: 0.0,
        }
    }
}

impl AdaptationState {
    /// An opponent killed the bot
    pub fn record_opponent_kill(&mut self) {
        self.opponent_kills += 1;
        self.kill_streak += 1;
        self.death_streak = 0;
        self.refresh_kd();
    }

    /// The bot killed an opponent
    pub fn record_opponent_death(&mut self) {
        self.opponent_deaths += 1;
        self.death_streak += 1;
        self.kill_streak = 0;
        self.refresh_kd();
    }

    pub fn record_opponent_shot(&mut self, hit: bool) {
        self.opponent_shots += 1;
        if hit {
            self.opponent_hits += 1;
        }
        self.recent_accuracy = self.opponent_hits as f32 / self.opponent_shots as f32;
    }

    pub fn record_round(&mut self, bot_won: bool) {
        if bot_won {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
    }

    fn refresh_kd(&mut self) {
        self.recent_kd_ratio = self.opponent_kills as f32 / self.opponent_deaths.max(1) as f32;
    }

    /// Bot win rate, or the target when no rounds were played yet
    pub fn bot_win_rate(&self) -> f32 {
        let rounds = self.wins + self.losses;
        if rounds == 0 {
            TARGET_WIN_RATE
        } else {
            self.wins as f32 / rounds as f32
        }
    }

    /// Start a new observation window, keeping round results
    pub fn reset_window(&mut self) {
        self.opponent_kills = 0;
        self.opponent_deaths = 0;
        self.opponent_shots = 0;
        self.opponent_hits = 0;
    }
}

/// Opponent frustration in `[0, 1]`
pub fn detect_frustration(profile: &SkillProfile, state: &AdaptationState) -> f32 {
    let mut frustration = 0.0;
    if state.death_streak >= 3 {
        frustration += (0.1 * state.death_streak as f32).min(0.4);
    }
    if state.recent_accuracy < 0.15 {
        frustration += 0.3;
    }
    if profile.performance_trend < 0.0 {
        frustration += (-profile.performance_trend * 0.5).min(0.3);
    }
    if state.recent_kd_ratio < 0.5 {
        frustration += 0.2;
    }
    frustration.clamp(0.0, 1.0)
}

/// Opponent boredom in `[0, 1]`
pub fn detect_boredom(profile: &SkillProfile, state: &AdaptationState) -> f32 {
    let mut boredom = 0.0;
    if state.recent_kd_ratio > 3.0 {
        boredom += 0.3;
    }
    if state.recent_accuracy > 0.7 {
        boredom += 0.3;
    }
    // Repetitive results
    if let Some(variance) = profile.player_metrics.mean_variance(5) {
        if variance < 0.01 {
            boredom += 0.2;
        }
    }
    if profile.performance_gap > 0.0 {
        boredom += (profile.performance_gap * 0.1).min(0.3);
    }
    boredom.clamp(0.0, 1.0)
}

/// Retune the profile at most once per adjustment interval.
/// Returns the change applied to the target skill, or `None` when throttled.
pub fn adjust_difficulty(profile: &mut SkillProfile, state: &mut AdaptationState, now: f32) -> Option<f32> {
    if let Some(last) = profile.last_adjustment {
        if now - last < ADJUST_INTERVAL {
            return None;
        }
    }
    profile.last_adjustment = Some(now);

    state.frustration = detect_frustration(profile, state);
    state.boredom = detect_boredom(profile, state);

    let win_rate_error = TARGET_WIN_RATE - state.bot_win_rate();
    let raw = win_rate_error + 0.5 * (state.boredom - state.frustration)
        + 0.05 * profile.performance_gap
        + 0.1 * profile.performance_trend;
    let adjustment = raw.clamp(-1.0, 1.0) * profile.learning_rate;

    profile.skill_velocity = profile.momentum * profile.skill_velocity + (1.0 - profile.momentum) * adjustment;
    let old_target = profile.target_skill;
    profile.target_skill = (profile.target_skill + profile.skill_velocity).clamp(profile.min_skill, profile.max_skill);
    let delta = profile.target_skill - old_target;

    profile.components.nudge(delta, profile.min_skill, profile.max_skill);
    profile.current_skill = profile.current_skill.clamp(profile.min_skill, profile.max_skill);
    profile.adjustments += 1;
    profile.confidence = (profile.confidence + 0.1).min(1.0);

    debug!(
        target = profile.target_skill,
        delta,
        frustration = state.frustration,
        boredom = state.boredom,
        win_rate = state.bot_win_rate(),
        "Difficulty adjusted"
    );
    state.reset_window();
    Some(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Metrics
    // ========================================================================

    #[test]
    fn test_metric_history_window() {
        let mut h = MetricHistory::default();
        for i in 0..(HISTORY_WINDOW + 10) {
            h.push(i as f32);
        }
        assert_eq!(h.len(), HISTORY_WINDOW);
        // Oldest ten were overwritten: window is 10..60
        assert!((h.average() - 34.5).abs() < 1e-3);
        assert_eq!(h.latest(), Some((HISTORY_WINDOW + 9) as f32));
    }

    #[test]
    fn test_metric_history_ignores_nan() {
        let mut h = MetricHistory::default();
        h.push(f32::NAN);
        assert!(h.is_empty());
    }

    #[test]
    fn test_performance_gap_direction() {
        let mut p = SkillProfile::new(0.5);
        p.update_metrics(MetricKind::KillDeathRatio, 3.0, 1.0);
        assert!(p.performance_gap > 0.0);

        let mut p = SkillProfile::new(0.5);
        // Opponent reacts slower than the bot
        p.update_metrics(MetricKind::ReactionTime, 0.6, 0.2);
        assert!(p.performance_gap < 0.0);
    }

    // ========================================================================
    // Detection
    // ========================================================================

    #[test]
    fn test_boredom_scenario() {
        let mut profile = SkillProfile::new(0.5);
        profile.performance_gap = 3.0;
        let state = AdaptationState {
            recent_kd_ratio: 5.0,
            recent_accuracy: 0.9,
            ..Default::default()
        };
        assert!(detect_boredom(&profile, &state) > 0.5);
    }

    #[test]
    fn test_frustration_from_death_streak() {
        let profile = SkillProfile::new(0.5);
        let mut state = AdaptationState::default();
        assert_eq!(detect_frustration(&profile, &state), 0.0);
        for _ in 0..5 {
            state.record_opponent_death();
        }
        state.recent_accuracy = 0.1;
        assert!(detect_frustration(&profile, &state) >= 0.7);
    }

    // ========================================================================
    // Adjustment
    // ========================================================================

    #[test]
    fn test_adjust_is_throttled() {
        let mut profile = SkillProfile::new(0.5);
        let mut state = AdaptationState::default();
        assert!(adjust_difficulty(&mut profile, &mut state, 0.0).is_some());
        assert!(adjust_difficulty(&mut profile, &mut state, 10.0).is_none());
        assert!(adjust_difficulty(&mut profile, &mut state, 30.0).is_some());
    }

    #[test]
    fn test_bored_opponent_raises_skill() {
        let mut profile = SkillProfile::new(0.5);
        profile.performance_gap = 3.0;
        let mut state = AdaptationState {
            recent_kd_ratio: 5.0,
            recent_accuracy: 0.9,
            losses: 5,
            ..Default::default()
        };
        let delta = adjust_difficulty(&mut profile, &mut state, 0.0).unwrap();
        assert!(delta > 0.0);
        assert!(profile.target_skill > 0.5);
        // Reaction moves fastest, teamwork slowest
        assert!(profile.components.reaction > profile.components.teamwork);
    }

    #[test]
    fn test_frustrated_opponent_lowers_skill() {
        let mut profile = SkillProfile::new(0.5);
        let mut state = AdaptationState { wins: 10, ..Default::default() };
        for _ in 0..6 {
            state.record_opponent_death();
        }
        state.recent_accuracy = 0.05;
        let delta = adjust_difficulty(&mut profile, &mut state, 0.0).unwrap();
        assert!(delta < 0.0);
    }

    #[test]
    fn test_adjust_clamps_everything() {
        let mut profile = SkillProfile::new(0.99);
        profile.learning_rate = 10.0;
        profile.momentum = 0.0;
        profile.performance_gap = 50.0;
        let mut state = AdaptationState {
            recent_kd_ratio: 9.0,
            recent_accuracy: 1.0,
            ..Default::default()
        };
        for i in 0..5 {
            adjust_difficulty(&mut profile, &mut state, i as f32 * ADJUST_INTERVAL);
            state.recent_kd_ratio = 9.0;
            state.recent_accuracy = 1.0;
        }
        let (lo, hi) = (profile.min_skill, profile.max_skill);
        for v in profile.components.values() {
            assert!((lo..=hi).contains(&v));
        }
        assert!((lo..=hi).contains(&profile.target_skill));
        assert!((lo..=hi).contains(&profile.current_skill));
    }

    #[test]
    fn test_interpolation_is_bounded() {
        let mut profile = SkillProfile::new(0.2);
        profile.target_skill = 0.9;
        profile.interpolate_level(1.0);
        assert!((profile.current_skill - (0.2 + INTERPOLATION_RATE)).abs() < 1e-6);
        profile.interpolate_level(1000.0);
        assert!((profile.current_skill - 0.9).abs() < 1e-6);
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    #[test]
    fn test_profile_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.skill");
        let mut profile = SkillProfile::new(0.7);
        profile.update_metrics(MetricKind::Accuracy, 0.4, 0.3);
        profile.save(&path).unwrap();

        let loaded = SkillProfile::load(&path).unwrap();
        assert_eq!(loaded.current_skill, profile.current_skill);
        assert_eq!(loaded.player_metrics.history(MetricKind::Accuracy).len(), 1);
    }

    #[test]
    fn test_load_or_new_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.skill");
        std::fs::write(&path, [0xff, 0xff, 0xff]).unwrap();
        let profile = SkillProfile::load_or_new(&path, 0.3);
        assert_eq!(profile.current_skill, 0.3);

        let missing = SkillProfile::load_or_new(&dir.path().join("none"), 0.6);
        assert_eq!(missing.target_skill, 0.6);
    }
}
