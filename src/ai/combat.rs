//! Tactical combat: threat list, state machine, network decision, aim and
//! weapon choice

use rand::Rng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::ai::constants::combat::{
    AIM_SPREAD_SCALE, BURST_PAUSE, DECISION_THRESHOLD, FEATURE_COUNT, FLAG_OUTPUT_BIAS, GRAVITY,
    GUERRILLA_ENGAGE_TIME, LOW_AMMO, LOW_HEALTH, MAX_THREATS, OUTPUT_COUNT, SEARCH_MEMORY_TIME,
};
use crate::ai::detail;
use crate::ai::neural::{Activation, LayerSpec, NetworkError, NeuralNetwork};
use crate::ai::perception::PerceptionSystem;
use crate::ai::weapons::{Inventory, Weapon};
use crate::util::gaussian;
use crate::util::vec3::Vec3;
use crate::world::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CombatState {
    #[default]
    Idle = 0,
    Searching,
    Engaging,
    Pursuing,
    Retreating,
    Flanking,
    Suppressing,
    Ambushing,
    Defending,
    Evading,
}

impl CombatState {
    pub fn ordinal(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CombatStyle {
    Aggressive,
    Rusher,
    Defensive,
    Sniper,
    Guerrilla,
    Support,
    #[default]
    Balanced,
}

/// How a combat style likes to fight
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngagementParams {
    pub optimal_range: f32,
    pub min_range: f32,
    pub max_range: f32,
    /// Multiplier on the bot's aim skill
    pub aim_accuracy: f32,
    /// Extra target lead in seconds
    pub prediction_time: f32,
    /// Seconds of sustained fire before a pause
    pub burst_duration: f32,
    /// Fraction of full speed used while strafing
    pub strafe_speed: f32,
    /// Chance per think of dodging while under fire
    pub dodge_probability: f32,
}

impl CombatStyle {
    pub fn engagement(self) -> EngagementParams {
        let (optimal_range, min_range, max_range) = match self {
            CombatStyle::Aggressive => (300.0, 0.0, 1200.0),
            CombatStyle::Rusher => (200.0, 0.0, 800.0),
            CombatStyle::Defensive => (600.0, 150.0, 2000.0),
            CombatStyle::Sniper => (1200.0, 300.0, 4000.0),
            CombatStyle::Guerrilla => (500.0, 100.0, 1500.0),
            CombatStyle::Support => (700.0, 100.0, 2000.0),
            CombatStyle::Balanced => (500.0, 64.0, 1500.0),
        };
        let (aim_accuracy, prediction_time, burst_duration, strafe_speed, dodge_probability) = match self {
            CombatStyle::Aggressive => (0.9, 0.1, 2.0, 1.0, 0.25),
            CombatStyle::Rusher => (0.85, 0.05, 2.5, 1.0, 0.2),
            CombatStyle::Defensive => (1.0, 0.15, 1.0, 0.7, 0.4),
            CombatStyle::Sniper => (1.1, 0.2, 0.5, 0.5, 0.3),
            CombatStyle::Guerrilla => (0.95, 0.15, 0.8, 0.9, 0.5),
            CombatStyle::Support => (0.85, 0.1, 3.0, 0.8, 0.3),
            CombatStyle::Balanced => (1.0, 0.1, 1.5, 0.8, 0.35),
        };
        EngagementParams {
            optimal_range,
            min_range,
            max_range,
            aim_accuracy,
            prediction_time,
            burst_duration,
            strafe_speed,
            dodge_probability,
        }
    }

    fn favors(self, weapon: Weapon) -> bool {
        match self {
            CombatStyle::Aggressive | CombatStyle::Rusher => {
                matches!(weapon, Weapon::Shotgun | Weapon::RocketLauncher)
            }
            CombatStyle::Sniper => weapon == Weapon::Railgun,
            CombatStyle::Defensive => matches!(weapon, Weapon::GrenadeLauncher | Weapon::RocketLauncher),
            CombatStyle::Support => {
                matches!(weapon, Weapon::Machinegun | Weapon::PlasmaGun | Weapon::LightningGun)
            }
            CombatStyle::Guerrilla => matches!(weapon, Weapon::LightningGun | Weapon::Shotgun),
            CombatStyle::Balanced => false,
        }
    }
}

/// One ranked enemy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreatInfo {
    pub id: EntityId,
    pub position: Vec3,
    pub velocity: Vec3,
    pub distance: f32,
    pub score: f32,
    pub visible: bool,
    pub visibility: f32,
    pub health: i32,
    pub armor: i32,
    pub weapon: Weapon,
    pub last_seen: f32,
}

/// Network output, thresholded
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CombatDecision {
    pub confidence: f32,
    pub aggression: f32,
    pub retreat: bool,
    pub take_cover: bool,
    pub flank: bool,
}

impl CombatDecision {
    pub fn from_outputs(outputs: &[f32]) -> Self {
        let at = |i: usize| outputs.get(i).copied().unwrap_or(0.0);
        Self {
            confidence: at(0),
            aggression: at(1),
            retreat: at(2) > DECISION_THRESHOLD,
            take_cover: at(3) > DECISION_THRESHOLD,
            flank: at(4) > DECISION_THRESHOLD,
        }
    }
}

/// Everything state selection looks at
#[derive(Debug, Clone, Copy, Default)]
pub struct CombatSituation {
    /// Highest ranked threat, if any
    pub primary: Option<ThreatInfo>,
    /// Age of the freshest enemy memory when nothing is visible
    pub memory_age: Option<f32>,
    pub health: i32,
    pub under_fire: bool,
    pub outnumbered: bool,
    pub weapon: Weapon,
    /// Seconds since combat started
    pub time_in_combat: f32,
    pub decision: Option<CombatDecision>,
}

/// Aim lead for a target. Hitscan weapons aim straight at the target.
pub fn calculate_aim_point<R: Rng + ?Sized>(
    shooter: Vec3,
    target: Vec3,
    target_velocity: Vec3,
    weapon: Weapon,
    accuracy: f32,
    rng: &mut R,
) -> Vec3 {
    let stats = weapon.stats();
    let mut aim = target;
    if !weapon.is_hitscan() {
        let speed = stats.projectile_speed;
        // Two refinement passes of the intercept time
        let mut t = shooter.distance_to(target) / speed;
        for _ in 0..2 {
            aim = target + target_velocity * t;
            t = shooter.distance_to(aim) / speed;
        }
        aim = target + target_velocity * t;
        if stats.gravity {
            aim.z += 0.5 * GRAVITY * t * t;
        }
    }

    let accuracy = accuracy.clamp(0.05, 1.0);
    let std_dev = shooter.distance_to(aim) * AIM_SPREAD_SCALE * (1.0 / accuracy - 1.0);
    if std_dev > 0.0 {
        aim += Vec3::new(
            gaussian(rng, std_dev),
            gaussian(rng, std_dev),
            gaussian(rng, std_dev),
        );
    }
    aim
}

/// Score of a weapon at a distance; higher is better
pub fn weapon_score(weapon: Weapon, distance: f32, style: CombatStyle) -> f32 {
    let stats = weapon.stats();
    let range = if distance >= stats.min_range && distance <= stats.max_range {
        let spread = stats.optimal_range.max(stats.max_range - stats.optimal_range).max(1.0);
        (1.0 - (distance - stats.optimal_range).abs() / spread).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let mut score = range * 40.0 + stats.dps / 500.0 * 30.0;
    if style.favors(weapon) {
        score += 10.0;
    }
    if weapon == Weapon::Shotgun && distance < 250.0 {
        score += 25.0;
    }
    if stats.splash_radius > 0.0 && distance < stats.splash_radius + 50.0 {
        score -= 40.0;
    }
    score
}

/// Best usable weapon for a distance
pub fn select_weapon(inventory: &Inventory, distance: f32, style: CombatStyle) -> Weapon {
    inventory
        .usable_weapons()
        .map(|w| (w, weapon_score(w, distance, style)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(Weapon::Gauntlet, |(w, _)| w)
}

/// State transition policy in priority order
pub fn select_state(style: CombatStyle, situation: &CombatSituation) -> CombatState {
    let Some(primary) = situation.primary else {
        return match situation.memory_age {
            Some(age) if age <= SEARCH_MEMORY_TIME => CombatState::Searching,
            _ => CombatState::Idle,
        };
    };

    if situation.health <= LOW_HEALTH && situation.under_fire {
        return CombatState::Retreating;
    }
    if let Some(decision) = situation.decision {
        if decision.retreat {
            return CombatState::Retreating;
        }
        if decision.flank && !situation.under_fire {
            return CombatState::Flanking;
        }
    }

    if !primary.visible {
        return CombatState::Searching;
    }

    // The weapon's envelope pulled toward the style's preferred ranges
    let stats = situation.weapon.stats();
    let params = style.engagement();
    let optimal = (stats.optimal_range + params.optimal_range) * 0.5;
    match style {
        CombatStyle::Aggressive | CombatStyle::Rusher => {
            if primary.distance > optimal {
                CombatState::Pursuing
            } else {
                CombatState::Engaging
            }
        }
        CombatStyle::Defensive | CombatStyle::Sniper => {
            let too_close = primary.distance < stats.min_range.max(params.min_range).max(optimal * 0.5);
            if too_close {
                CombatState::Evading
            } else if style == CombatStyle::Defensive {
                CombatState::Defending
            } else {
                CombatState::Engaging
            }
        }
        CombatStyle::Guerrilla => {
            if situation.time_in_combat > GUERRILLA_ENGAGE_TIME {
                CombatState::Retreating
            } else {
                CombatState::Ambushing
            }
        }
        CombatStyle::Support => CombatState::Suppressing,
        CombatStyle::Balanced => CombatState::Engaging,
    }
}

/// Per-bot combat controller
#[derive(Debug, Clone)]
pub struct TacticalCombat {
    pub style: CombatStyle,
    pub debug: bool,
    state: CombatState,
    previous_state: CombatState,
    state_entered: f32,
    combat_started: Option<f32>,
    network: NeuralNetwork,
    threats: SmallVec<[ThreatInfo; MAX_THREATS]>,
    last_decision: Option<CombatDecision>,
    burst_started: Option<f32>,
    burst_resume_at: f32,
    shots: u32,
    hits: u32,
}

impl TacticalCombat {
    pub fn new<R: Rng + ?Sized>(style: CombatStyle, rng: &mut R) -> Result<Self, NetworkError> {
        Ok(Self {
            style,
            debug: false,
            state: CombatState::Idle,
            previous_state: CombatState::Idle,
            state_entered: 0.0,
            combat_started: None,
            network: Self::build_network(rng)?,
            threats: SmallVec::new(),
            last_decision: None,
            burst_started: None,
            burst_resume_at: 0.0,
            shots: 0,
            hits: 0,
        })
    }

    /// 15 inputs, two ReLU hidden layers, 5 sigmoid outputs. The flag outputs
    /// start biased low so an untrained net rarely retreats or flanks.
    pub fn build_network<R: Rng + ?Sized>(rng: &mut R) -> Result<NeuralNetwork, NetworkError> {
        let mut net = NeuralNetwork::new(
            FEATURE_COUNT,
            &[
                LayerSpec::new(24, Activation::ReLU),
                LayerSpec::new(16, Activation::ReLU),
                LayerSpec::new(OUTPUT_COUNT, Activation::Sigmoid),
            ],
            rng,
        )?;
        net.set_output_bias(&[0.0, 0.0, FLAG_OUTPUT_BIAS, FLAG_OUTPUT_BIAS, FLAG_OUTPUT_BIAS])?;
        Ok(net)
    }

    pub fn network(&self) -> &NeuralNetwork {
        &self.network
    }

    pub fn state(&self) -> CombatState {
        self.state
    }

    pub fn previous_state(&self) -> CombatState {
        self.previous_state
    }

    pub fn threats(&self) -> &[ThreatInfo] {
        &self.threats
    }

    /// Current target: always the highest ranked threat
    pub fn target(&self) -> Option<&ThreatInfo> {
        self.threats.first()
    }

    pub fn last_decision(&self) -> Option<CombatDecision> {
        self.last_decision
    }

    pub fn record_shot(&mut self, hit: bool) {
        self.shots += 1;
        if hit {
            self.hits += 1;
        }
    }

    /// Observed hit ratio, 0 before the first shot
    pub fn accuracy(&self) -> f32 {
        if self.shots == 0 {
            0.0
        } else {
            self.hits as f32 / self.shots as f32
        }
    }

    /// Rebuild the ranked threat list from perception: visible enemies with
    /// their perception scores, then remembered enemies at reduced weight
    pub fn update_threats(&mut self, perception: &PerceptionSystem, now: f32) {
        self.threats.clear();
        for info in perception.visible_enemies() {
            self.threats.push(ThreatInfo {
                id: info.id,
                position: info.position,
                velocity: info.velocity,
                distance: info.distance,
                score: info.threat_score,
                visible: true,
                visibility: info.visibility,
                health: info.health,
                armor: info.armor,
                weapon: info.weapon,
                last_seen: now,
            });
        }
        let origin = perception.self_state().position;
        for entry in perception.memory() {
            if !entry.info.is_enemy || self.threats.iter().any(|t| t.id == entry.info.id) {
                continue;
            }
            self.threats.push(ThreatInfo {
                id: entry.info.id,
                position: entry.info.position,
                velocity: Vec3::ZERO,
                distance: entry.info.position.distance_to(origin),
                score: entry.info.threat_score * entry.confidence * 0.5,
                visible: false,
                visibility: 0.0,
                health: entry.info.health,
                armor: entry.info.armor,
                weapon: entry.info.weapon,
                last_seen: entry.last_seen,
            });
        }
        self.threats.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.threats.truncate(MAX_THREATS);
    }

    /// Fixed-width network input
    pub fn features(&self, situation: &CombatSituation, dodge_success: f32, ammo: i32) -> [f32; FEATURE_COUNT] {
        let mut f = [0.0; FEATURE_COUNT];
        if let Some(p) = situation.primary {
            f[0] = (p.distance / 2000.0).min(1.0);
            f[1] = (p.score / 100.0).min(1.0);
            f[2] = p.visibility;
            f[3] = (p.health as f32 / 100.0).clamp(0.0, 2.0);
            f[4] = (p.armor as f32 / 100.0).clamp(0.0, 2.0);
            f[5] = p.weapon.stats().danger;
        }
        f[6] = self.state.ordinal() as f32 / 9.0;
        f[7] = self.accuracy();
        f[8] = dodge_success;
        f[9] = situation.under_fire as u8 as f32;
        f[10] = (situation.health <= LOW_HEALTH) as u8 as f32;
        f[11] = (situation.weapon != Weapon::Gauntlet && ammo <= LOW_AMMO) as u8 as f32;
        f[12] = situation.outnumbered as u8 as f32;
        f[13] = self.threats.len() as f32 / MAX_THREATS as f32;
        f[14] = (situation.health as f32 / 100.0).clamp(0.0, 2.0);
        f
    }

    /// Run the decision network on a feature vector
    pub fn make_decision(&mut self, features: &[f32; FEATURE_COUNT]) -> Result<CombatDecision, NetworkError> {
        let outputs = self.network.predict(features)?;
        let decision = CombatDecision::from_outputs(&outputs);
        self.last_decision = Some(decision);
        Ok(decision)
    }

    /// Apply the transition policy and track time in state
    pub fn update_state(&mut self, situation: &CombatSituation, now: f32) -> CombatState {
        let next = select_state(self.style, situation);
        let in_combat = !matches!(next, CombatState::Idle | CombatState::Searching);
        match (in_combat, self.combat_started) {
            (true, None) => self.combat_started = Some(now),
            (false, Some(_)) => self.combat_started = None,
            _ => {}
        }
        if next != self.state {
            detail!(self.debug, from = ?self.state, to = ?next, "Combat state change");
            self.previous_state = self.state;
            self.state = next;
            self.state_entered = now;
        }
        next
    }

    /// Break sustained fire into bursts of the style's length. Returns
    /// whether the trigger may be held this think.
    pub fn burst_allows(&mut self, wants_fire: bool, now: f32) -> bool {
        if !wants_fire {
            self.burst_started = None;
            return false;
        }
        if now < self.burst_resume_at {
            return false;
        }
        match self.burst_started {
            None => {
                self.burst_started = Some(now);
                true
            }
            Some(start) if now - start >= self.style.engagement().burst_duration => {
                self.burst_started = None;
                self.burst_resume_at = now + BURST_PAUSE;
                false
            }
            Some(_) => true,
        }
    }

    /// Seconds since the current engagement began
    pub fn time_in_combat(&self, now: f32) -> f32 {
        self.combat_started.map_or(0.0, |t| now - t)
    }

    pub fn reset(&mut self) {
        self.state = CombatState::Idle;
        self.previous_state = CombatState::Idle;
        self.combat_started = None;
        self.threats.clear();
        self.last_decision = None;
        self.burst_started = None;
        self.burst_resume_at = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn threat(distance: f32, visible: bool) -> ThreatInfo {
        ThreatInfo {
            id: 1,
            position: Vec3::new(distance, 0.0, 24.0),
            velocity: Vec3::ZERO,
            distance,
            score: 50.0,
            visible,
            visibility: if visible { 0.8 } else { 0.0 },
            health: 100,
            armor: 0,
            weapon: Weapon::Machinegun,
            last_seen: 0.0,
        }
    }

    fn engaged(distance: f32) -> CombatSituation {
        CombatSituation {
            primary: Some(threat(distance, true)),
            health: 100,
            weapon: Weapon::Machinegun,
            ..Default::default()
        }
    }

    const ALL_STYLES: [CombatStyle; 7] = [
        CombatStyle::Aggressive,
        CombatStyle::Rusher,
        CombatStyle::Defensive,
        CombatStyle::Sniper,
        CombatStyle::Guerrilla,
        CombatStyle::Support,
        CombatStyle::Balanced,
    ];

    // ========================================================================
    // State selection
    // ========================================================================

    #[test]
    fn test_low_health_under_fire_retreats_for_every_style() {
        let situation = CombatSituation {
            health: 20,
            under_fire: true,
            decision: Some(CombatDecision { flank: true, ..Default::default() }),
            ..engaged(300.0)
        };
        for style in ALL_STYLES {
            assert_eq!(select_state(style, &situation), CombatState::Retreating, "{style:?}");
        }
    }

    #[test]
    fn test_no_threat_search_or_idle() {
        let recent = CombatSituation {
            memory_age: Some(2.0),
            health: 100,
            ..Default::default()
        };
        assert_eq!(select_state(CombatStyle::Balanced, &recent), CombatState::Searching);
        let stale = CombatSituation {
            memory_age: Some(8.0),
            ..recent
        };
        assert_eq!(select_state(CombatStyle::Balanced, &stale), CombatState::Idle);
        assert_eq!(select_state(CombatStyle::Balanced, &CombatSituation::default()), CombatState::Idle);
    }

    #[test]
    fn test_decision_overrides() {
        let retreat = CombatSituation {
            decision: Some(CombatDecision { retreat: true, ..Default::default() }),
            ..engaged(300.0)
        };
        assert_eq!(select_state(CombatStyle::Aggressive, &retreat), CombatState::Retreating);

        let flank = CombatSituation {
            decision: Some(CombatDecision { flank: true, ..Default::default() }),
            ..engaged(300.0)
        };
        assert_eq!(select_state(CombatStyle::Aggressive, &flank), CombatState::Flanking);
        let pinned = CombatSituation { under_fire: true, ..flank };
        assert_ne!(select_state(CombatStyle::Aggressive, &pinned), CombatState::Flanking);
    }

    #[test]
    fn test_style_branches() {
        // Machinegun optimal range is 500
        assert_eq!(select_state(CombatStyle::Aggressive, &engaged(800.0)), CombatState::Pursuing);
        assert_eq!(select_state(CombatStyle::Rusher, &engaged(300.0)), CombatState::Engaging);
        assert_eq!(select_state(CombatStyle::Sniper, &engaged(100.0)), CombatState::Evading);
        assert_eq!(select_state(CombatStyle::Sniper, &engaged(900.0)), CombatState::Engaging);
        assert_eq!(select_state(CombatStyle::Defensive, &engaged(900.0)), CombatState::Defending);
        assert_eq!(select_state(CombatStyle::Support, &engaged(300.0)), CombatState::Suppressing);
        assert_eq!(select_state(CombatStyle::Guerrilla, &engaged(300.0)), CombatState::Ambushing);
        let long_fight = CombatSituation {
            time_in_combat: 4.0,
            ..engaged(300.0)
        };
        assert_eq!(select_state(CombatStyle::Guerrilla, &long_fight), CombatState::Retreating);

        let hidden = CombatSituation {
            primary: Some(threat(300.0, false)),
            ..engaged(300.0)
        };
        assert_eq!(select_state(CombatStyle::Aggressive, &hidden), CombatState::Searching);
    }

    #[test]
    fn test_engagement_envelopes_are_ordered() {
        for style in ALL_STYLES {
            let p = style.engagement();
            assert!(p.min_range < p.optimal_range && p.optimal_range < p.max_range, "{style:?}");
            assert!((0.0..=1.0).contains(&p.dodge_probability));
            assert!(p.burst_duration > 0.0);
        }
        assert!(CombatStyle::Sniper.engagement().optimal_range > CombatStyle::Rusher.engagement().optimal_range);
    }

    #[test]
    fn test_burst_fire_pauses() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut combat = TacticalCombat::new(CombatStyle::Sniper, &mut rng).expect("combat");
        let burst = CombatStyle::Sniper.engagement().burst_duration;

        assert!(combat.burst_allows(true, 0.0));
        assert!(combat.burst_allows(true, burst * 0.5));
        assert!(!combat.burst_allows(true, burst));
        assert!(!combat.burst_allows(true, burst + BURST_PAUSE * 0.5));
        assert!(combat.burst_allows(true, burst + BURST_PAUSE));

        // Letting go ends the burst
        assert!(!combat.burst_allows(false, burst + BURST_PAUSE + 0.1));
        assert!(combat.burst_allows(true, burst + BURST_PAUSE + 0.2));
    }

    #[test]
    fn test_update_state_tracks_transitions() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut combat = TacticalCombat::new(CombatStyle::Balanced, &mut rng).expect("combat");
        assert_eq!(combat.update_state(&engaged(300.0), 1.0), CombatState::Engaging);
        assert_eq!(combat.previous_state(), CombatState::Idle);
        assert!((combat.time_in_combat(3.0) - 2.0).abs() < 1e-6);
        combat.update_state(&CombatSituation::default(), 4.0);
        assert_eq!(combat.state(), CombatState::Idle);
        assert_eq!(combat.time_in_combat(5.0), 0.0);
    }

    #[test]
    fn test_threats_merge_vision_and_memory() {
        use crate::world::brush::standing_player;
        use crate::world::{BrushWorld, Team, World};

        let mut rng = StdRng::seed_from_u64(3);
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        let seen = world.spawn(standing_player(0, 400.0, 0.0, Team::Blue));
        let lost = world.spawn(standing_player(0, 600.0, 100.0, Team::Blue));

        let mut perception = PerceptionSystem::default();
        perception.update(&world, me, &mut rng);
        let original = perception.recall(lost).expect("remembered").info.threat_score;
        assert!(original > 0.0);

        // Step behind the bot, out of its field of view
        if let Some(e) = world.entity_mut(lost) {
            e.position.x = -300.0;
            e.position.y = 0.0;
        }
        world.advance(0.2);
        perception.update(&world, me, &mut rng);

        let mut combat = TacticalCombat::new(CombatStyle::Balanced, &mut rng).expect("combat");
        combat.update_threats(&perception, world.time());
        let threats = combat.threats();
        assert_eq!(threats.len(), 2);

        let visible = threats.iter().find(|t| t.id == seen).expect("visible threat");
        assert!(visible.visible);
        let remembered = threats.iter().find(|t| t.id == lost).expect("remembered threat");
        assert!(!remembered.visible);
        assert!(remembered.score > 0.0);
        assert!(remembered.score <= original * 0.5 + 1e-4);
        assert!((remembered.position.x - 600.0).abs() < 1e-3);
        assert!(threats.windows(2).all(|w| w[0].score >= w[1].score));
    }

    // ========================================================================
    // Decision network
    // ========================================================================

    #[test]
    fn test_untrained_network_is_conservative() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut combat = TacticalCombat::new(CombatStyle::Balanced, &mut rng).expect("combat");
        let features = combat.features(&engaged(300.0), 0.0, 50);
        let decision = combat.make_decision(&features).expect("decision");
        assert!((0.0..=1.0).contains(&decision.confidence));
        assert!((0.0..=1.0).contains(&decision.aggression));
        assert_eq!(combat.last_decision(), Some(decision));
    }

    #[test]
    fn test_features_flags() {
        let mut rng = StdRng::seed_from_u64(3);
        let combat = TacticalCombat::new(CombatStyle::Balanced, &mut rng).expect("combat");
        let situation = CombatSituation {
            health: 20,
            under_fire: true,
            outnumbered: true,
            ..engaged(1000.0)
        };
        let f = combat.features(&situation, 0.5, 2);
        assert_eq!(f[0], 0.5);
        assert_eq!(f[8], 0.5);
        assert_eq!(f[9], 1.0);
        assert_eq!(f[10], 1.0);
        assert_eq!(f[11], 1.0);
        assert_eq!(f[12], 1.0);
    }

    // ========================================================================
    // Aim and weapons
    // ========================================================================

    #[test]
    fn test_hitscan_aims_at_target() {
        let mut rng = StdRng::seed_from_u64(4);
        let target = Vec3::new(500.0, 0.0, 0.0);
        let aim = calculate_aim_point(Vec3::ZERO, target, Vec3::new(0.0, 300.0, 0.0), Weapon::Railgun, 1.0, &mut rng);
        assert!(aim.approx_eq(target, 1e-3));
    }

    #[test]
    fn test_projectile_leads_target() {
        let mut rng = StdRng::seed_from_u64(5);
        let target = Vec3::new(900.0, 0.0, 0.0);
        let aim = calculate_aim_point(Vec3::ZERO, target, Vec3::new(0.0, 300.0, 0.0), Weapon::RocketLauncher, 1.0, &mut rng);
        // About one second of flight
        assert!(aim.y > 250.0 && aim.y < 350.0);
        let lob = calculate_aim_point(Vec3::ZERO, Vec3::new(700.0, 0.0, 0.0), Vec3::ZERO, Weapon::GrenadeLauncher, 1.0, &mut rng);
        assert!(lob.z > 300.0);
    }

    #[test]
    fn test_spread_grows_with_low_accuracy() {
        let mut rng = StdRng::seed_from_u64(6);
        let target = Vec3::new(1000.0, 0.0, 0.0);
        let mean_error = |acc: f32, rng: &mut StdRng| {
            (0..200)
                .map(|_| calculate_aim_point(Vec3::ZERO, target, Vec3::ZERO, Weapon::Machinegun, acc, rng).distance_to(target))
                .sum::<f32>()
                / 200.0
        };
        let sharp = mean_error(0.9, &mut rng);
        let sloppy = mean_error(0.2, &mut rng);
        assert!(sloppy > sharp * 3.0);
    }

    #[test]
    fn test_shotgun_at_close_range() {
        let mut inv = Inventory::spawn_loadout();
        inv.give(Weapon::Shotgun, 10);
        inv.give(Weapon::Railgun, 10);
        for style in ALL_STYLES {
            assert_eq!(select_weapon(&inv, 150.0, style), Weapon::Shotgun, "{style:?}");
        }
    }

    #[test]
    fn test_no_ammo_falls_back() {
        let mut inv = Inventory::spawn_loadout();
        inv.give(Weapon::Shotgun, 0);
        assert_eq!(select_weapon(&inv, 150.0, CombatStyle::Balanced), Weapon::Machinegun);
        assert_eq!(select_weapon(&Inventory::default(), 150.0, CombatStyle::Balanced), Weapon::Gauntlet);
    }

    #[test]
    fn test_splash_avoided_point_blank() {
        assert!(weapon_score(Weapon::RocketLauncher, 80.0, CombatStyle::Aggressive) < weapon_score(Weapon::RocketLauncher, 450.0, CombatStyle::Aggressive));
        let mut inv = Inventory::spawn_loadout();
        inv.give(Weapon::RocketLauncher, 10);
        inv.give(Weapon::Railgun, 10);
        assert_eq!(select_weapon(&inv, 1400.0, CombatStyle::Sniper), Weapon::Railgun);
    }
}
