//! Per-bot perception
//!
//! Each update refreshes the bot's view of itself, rescans vision and
//! hearing on their own intervals, folds what was seen into a decaying
//! memory, ranks threats and probes the surrounding space.

use hashbrown::HashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::trace;

use crate::ai::constants::perception::{
    BOXED_IN_RATIO, DEFAULT_DECAY_RATE, DEFAULT_FOV_DEGREES, DEFAULT_HEARING_RANGE,
    DEFAULT_PERIPHERAL_DEGREES, DEFAULT_PERIPHERAL_SENSITIVITY, DEFAULT_VISION_RANGE,
    FLANK_SEPARATION, HEARING_UPDATE_INTERVAL, HIGH_GROUND_DELTA, LOS_MIN_FRACTION,
    MAX_MEMORY_ENTRIES, MAX_SOUNDS, MAX_VISIBLE_ENTITIES, MEMORY_MAX_AGE, MEMORY_MIN_CONFIDENCE,
    MIN_SOUND_VOLUME, MOTION_REFERENCE_SPEED, OCCLUSION_FACTOR, OUTNUMBERED_THREATS,
    SOUND_EVENT_WINDOW, SPATIAL_PROBE_DISTANCE, UNDER_FIRE_WINDOW, VISION_UPDATE_INTERVAL,
};
use crate::ai::constants::threat::{
    CAN_HIT_ME_BONUS, CAN_I_HIT_BONUS, CRITICAL_THRESHOLD, DISTANCE_WEIGHT, FACING_HALF_ANGLE,
    HEALTH_WEIGHT, HIGH_THRESHOLD, MEDIUM_THRESHOLD, PRIOR_DAMAGE_CAP, PRIOR_DAMAGE_SCALE,
    PRIOR_DAMAGE_WINDOW, VISIBILITY_BONUS, WEAPON_WEIGHT,
};
use crate::ai::weapons::Weapon;
use crate::util::ring::RingBuffer;
use crate::util::vec3::Vec3;
use crate::world::{ContentMask, EntityEvents, EntityId, EntityKind, EntityState, Team, World};

/// Coarse type tag of a perceived entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityCategory {
    Player,
    Item,
    Powerup,
    Projectile,
}

impl EntityCategory {
    fn of(kind: EntityKind) -> Option<Self> {
        match kind {
            EntityKind::Player => Some(EntityCategory::Player),
            EntityKind::Health | EntityKind::Armor | EntityKind::WeaponPickup(_) | EntityKind::Ammo(_) => {
                Some(EntityCategory::Item)
            }
            EntityKind::Powerup => Some(EntityCategory::Powerup),
            EntityKind::Projectile(_) => Some(EntityCategory::Projectile),
            EntityKind::Other => None,
        }
    }

    /// Relative apparent size used in visibility confidence
    fn size_factor(self) -> f32 {
        match self {
            EntityCategory::Player | EntityCategory::Powerup => 1.0,
            EntityCategory::Item => 0.8,
            EntityCategory::Projectile => 0.6,
        }
    }
}

/// Something the bot can see this tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityInfo {
    pub id: EntityId,
    pub category: EntityCategory,
    pub kind: EntityKind,
    pub position: Vec3,
    pub velocity: Vec3,
    /// Where the entity is looking
    pub view_dir: Vec3,
    pub distance: f32,
    /// Visibility confidence in `[0, 1]`
    pub visibility: f32,
    pub threat_score: f32,
    pub is_enemy: bool,
    pub is_ally: bool,
    pub health: i32,
    pub armor: i32,
    pub weapon: Weapon,
    /// Seen inside the focused field of view rather than peripherally
    pub focused: bool,
    pub seen_at: f32,
}

/// Remembered entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub info: EntityInfo,
    pub last_seen: f32,
    pub confidence: f32,
    /// Time decay was last applied
    last_decay: f32,
}

impl MemoryEntry {
    pub fn age(&self, now: f32) -> f32 {
        now - self.last_seen
    }
}

/// What produced a sound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoundKind {
    Weapon,
    Pain,
    Jump,
    Footstep,
}

impl SoundKind {
    fn base_volume(self) -> f32 {
        match self {
            SoundKind::Weapon => 1.0,
            SoundKind::Pain => 0.6,
            SoundKind::Jump => 0.4,
            SoundKind::Footstep => 0.3,
        }
    }

    fn from_events(events: EntityEvents) -> Option<Self> {
        // Loudest event wins
        if events.contains(EntityEvents::FIRED) {
            Some(SoundKind::Weapon)
        } else if events.contains(EntityEvents::PAIN) {
            Some(SoundKind::Pain)
        } else if events.contains(EntityEvents::JUMPED) {
            Some(SoundKind::Jump)
        } else if events.contains(EntityEvents::FOOTSTEP) {
            Some(SoundKind::Footstep)
        } else {
            None
        }
    }
}

/// A heard event
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SoundEvent {
    pub source: EntityId,
    pub position: Vec3,
    pub kind: SoundKind,
    pub volume: f32,
    pub time: f32,
    pub is_enemy: bool,
}

/// Threat bands. Scores on a boundary map to the higher band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ThreatLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn from_score(score: f32) -> Self {
        if score >= CRITICAL_THRESHOLD {
            ThreatLevel::Critical
        } else if score >= HIGH_THRESHOLD {
            ThreatLevel::High
        } else if score >= MEDIUM_THRESHOLD {
            ThreatLevel::Medium
        } else {
            ThreatLevel::Low
        }
    }
}

/// Inputs to [`threat_score`]
#[derive(Debug, Clone, Copy)]
pub struct ThreatFactors {
    pub distance: f32,
    pub max_range: f32,
    /// Danger rating of the enemy's weapon (0..1)
    pub weapon_danger: f32,
    /// The observing bot's own health
    pub own_health: i32,
    pub visible: bool,
    pub can_hit_me: bool,
    pub can_i_hit: bool,
    /// Damage this enemy dealt recently
    pub prior_damage: f32,
}

/// Scalar danger of one enemy
pub fn threat_score(f: &ThreatFactors) -> f32 {
    let distance_factor = if f.max_range > 0.0 {
        (1.0 - f.distance / f.max_range).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let health_factor = 1.0 - (f.own_health as f32 / 100.0).clamp(0.0, 1.0);
    let mut score = distance_factor * DISTANCE_WEIGHT
        + f.weapon_danger.clamp(0.0, 1.0) * WEAPON_WEIGHT
        + health_factor * HEALTH_WEIGHT;
    if f.visible {
        score += VISIBILITY_BONUS;
    }
    if f.can_hit_me {
        score += CAN_HIT_ME_BONUS;
    }
    if f.can_i_hit {
        score += CAN_I_HIT_BONUS;
    }
    score + (f.prior_damage * PRIOR_DAMAGE_SCALE).min(PRIOR_DAMAGE_CAP)
}

/// Aggregate threat picture
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreatAssessment {
    pub primary: Option<EntityId>,
    pub secondary: Option<EntityId>,
    pub primary_score: f32,
    pub level: ThreatLevel,
    pub threat_count: usize,
    pub threat_center: Option<Vec3>,
    pub flanked: bool,
    pub outnumbered: bool,
    pub under_fire: bool,
    pub last_damage_time: Option<f32>,
}

/// Short-range openness around the bot
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpatialAwareness {
    pub nearest_wall_distance: f32,
    pub nearest_wall_direction: Vec3,
    /// Mean free fraction over the probe directions
    pub open_ratio: f32,
    pub boxed_in: bool,
    pub escape_direction: Option<Vec3>,
    pub high_ground: bool,
}

impl Default for SpatialAwareness {
    fn default() -> Self {
        Self {
            nearest_wall_distance: SPATIAL_PROBE_DISTANCE,
            nearest_wall_direction: Vec3::ZERO,
            open_ratio: 1.0,
            boxed_in: false,
            escape_direction: None,
            high_ground: false,
        }
    }
}

/// Filter settings
#[derive(Debug, Clone, Copy)]
pub struct PerceptionConfig {
    pub vision_range: f32,
    pub fov_degrees: f32,
    pub peripheral_degrees: f32,
    pub peripheral_sensitivity: f32,
    pub decay_rate: f32,
    pub hearing_range: f32,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            vision_range: DEFAULT_VISION_RANGE,
            fov_degrees: DEFAULT_FOV_DEGREES,
            peripheral_degrees: DEFAULT_PERIPHERAL_DEGREES,
            peripheral_sensitivity: DEFAULT_PERIPHERAL_SENSITIVITY,
            decay_rate: DEFAULT_DECAY_RATE,
            hearing_range: DEFAULT_HEARING_RANGE,
        }
    }
}

/// Snapshot of the bot's own entity
#[derive(Debug, Clone, Default)]
pub struct SelfState {
    pub id: EntityId,
    pub alive: bool,
    pub position: Vec3,
    pub eye: Vec3,
    pub velocity: Vec3,
    pub view_dir: Vec3,
    pub angles: Vec3,
    pub health: i32,
    pub armor: i32,
    pub team: Team,
    pub weapon: Weapon,
    pub on_ground: bool,
}

impl SelfState {
    fn from_entity(e: &EntityState) -> Self {
        Self {
            id: e.id,
            alive: e.is_alive_player(),
            position: e.position,
            eye: e.eye(),
            velocity: e.velocity,
            view_dir: e.view_dir(),
            angles: e.angles,
            health: e.health,
            armor: e.armor,
            team: e.team,
            weapon: e.weapon,
            on_ground: e.on_ground,
        }
    }
}

/// Per-bot perception state
#[derive(Debug, Clone)]
pub struct PerceptionSystem {
    pub config: PerceptionConfig,
    self_state: SelfState,
    visible: Vec<EntityInfo>,
    memory: Vec<MemoryEntry>,
    sounds: RingBuffer<SoundEvent>,
    threats: ThreatAssessment,
    spatial: SpatialAwareness,
    /// Recent damage per attacker: (amount, time of last hit)
    damage_by: HashMap<EntityId, (f32, f32)>,
    last_vision_update: Option<f32>,
    last_hearing_update: Option<f32>,
    last_health: Option<i32>,
    scans: u64,
}

impl Default for PerceptionSystem {
    fn default() -> Self {
        Self::new(PerceptionConfig::default())
    }
}

impl PerceptionSystem {
    pub fn new(config: PerceptionConfig) -> Self {
        Self {
            config,
            self_state: SelfState::default(),
            visible: Vec::with_capacity(MAX_VISIBLE_ENTITIES),
            memory: Vec::with_capacity(MAX_MEMORY_ENTRIES),
            sounds: RingBuffer::new(MAX_SOUNDS),
            threats: ThreatAssessment::default(),
            spatial: SpatialAwareness::default(),
            damage_by: HashMap::new(),
            last_vision_update: None,
            last_hearing_update: None,
            last_health: None,
            scans: 0,
        }
    }

    pub fn self_state(&self) -> &SelfState {
        &self.self_state
    }

    pub fn visible(&self) -> &[EntityInfo] {
        &self.visible
    }

    pub fn visible_enemies(&self) -> impl Iterator<Item = &EntityInfo> {
        self.visible.iter().filter(|e| e.is_enemy)
    }

    pub fn visible_entity(&self, id: EntityId) -> Option<&EntityInfo> {
        self.visible.iter().find(|e| e.id == id)
    }

    pub fn memory(&self) -> &[MemoryEntry] {
        &self.memory
    }

    pub fn recall(&self, id: EntityId) -> Option<&MemoryEntry> {
        self.memory.iter().find(|m| m.info.id == id)
    }

    pub fn sounds(&self) -> impl Iterator<Item = &SoundEvent> {
        self.sounds.iter()
    }

    pub fn threats(&self) -> &ThreatAssessment {
        &self.threats
    }

    pub fn spatial(&self) -> &SpatialAwareness {
        &self.spatial
    }

    /// Number of vision scans performed
    pub fn scans(&self) -> u64 {
        self.scans
    }

    /// Most confident remembered enemy that is not currently visible
    pub fn best_enemy_memory(&self) -> Option<&MemoryEntry> {
        self.memory
            .iter()
            .filter(|m| m.info.is_enemy && self.visible_entity(m.info.id).is_none())
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }

    /// Damage this bot received, used by threat scoring
    pub fn record_damage(&mut self, attacker: EntityId, amount: f32, now: f32) {
        let entry = self.damage_by.entry(attacker).or_insert((0.0, now));
        if now - entry.1 > PRIOR_DAMAGE_WINDOW {
            entry.0 = 0.0;
        }
        entry.0 += amount;
        entry.1 = now;
        self.threats.last_damage_time = Some(now);
    }

    fn prior_damage(&self, attacker: EntityId, now: f32) -> f32 {
        match self.damage_by.get(&attacker) {
            Some(&(amount, time)) if now - time <= PRIOR_DAMAGE_WINDOW => amount,
            _ => 0.0,
        }
    }

    /// Forget everything, used on respawn
    pub fn reset(&mut self) {
        self.visible.clear();
        self.memory.clear();
        self.sounds.clear();
        self.threats = ThreatAssessment::default();
        self.spatial = SpatialAwareness::default();
        self.damage_by.clear();
        self.last_vision_update = None;
        self.last_hearing_update = None;
        self.last_health = None;
    }

    /// Run one perception update against the world
    pub fn update<W: World + ?Sized, R: Rng + ?Sized>(&mut self, world: &W, self_id: EntityId, rng: &mut R) {
        let now = world.time();

        // (a) self state
        match world.entity(self_id) {
            Some(e) => self.self_state = SelfState::from_entity(e),
            None => {
                self.self_state.alive = false;
            }
        }
        if let Some(prev) = self.last_health {
            if self.self_state.health < prev {
                self.threats.last_damage_time = Some(now);
            }
        }
        self.last_health = Some(self.self_state.health);

        if !self.self_state.alive {
            self.visible.clear();
            self.decay_memory(now);
            self.threats = ThreatAssessment {
                last_damage_time: self.threats.last_damage_time,
                ..Default::default()
            };
            return;
        }

        // (b)-(d) vision
        let vision_due = self.last_vision_update.map_or(true, |t| now - t >= VISION_UPDATE_INTERVAL);
        if vision_due {
            self.last_vision_update = Some(now);
            self.scan_vision(world, now, rng);
            self.scans += 1;
        }

        // (e) hearing
        let hearing_due = self.last_hearing_update.map_or(true, |t| now - t >= HEARING_UPDATE_INTERVAL);
        if hearing_due {
            self.last_hearing_update = Some(now);
            self.update_hearing(world, now);
        }

        // (f) threats, then memory so remembered entries keep their scores
        self.assess_threats(now);
        self.merge_memory(now);

        // (g) spatial
        self.update_spatial(world);

        trace!(
            bot = self_id,
            visible = self.visible.len(),
            memory = self.memory.len(),
            threats = self.threats.threat_count,
            "Perception updated"
        );
    }

    fn scan_vision<W: World + ?Sized, R: Rng + ?Sized>(&mut self, world: &W, now: f32, rng: &mut R) {
        self.visible.clear();
        let me = self.self_state.clone();
        let half_fov = self.config.fov_degrees * 0.5;
        let half_peripheral = (self.config.peripheral_degrees * 0.5).max(half_fov);
        let range_sq = self.config.vision_range * self.config.vision_range;

        for e in world.entities() {
            if self.visible.len() >= MAX_VISIBLE_ENTITIES {
                break;
            }
            if !e.in_use || e.id == me.id {
                continue;
            }
            let Some(category) = EntityCategory::of(e.kind) else {
                continue;
            };
            if category == EntityCategory::Player && !e.is_alive_player() {
                continue;
            }

            let target = if category == EntityCategory::Player { e.eye() } else { e.position };
            let to_target = target - me.eye;
            let dist_sq = to_target.length_sq();
            if dist_sq > range_sq {
                continue;
            }

            let angle = me.view_dir.angle_between(to_target).to_degrees();
            let focused = angle <= half_fov;
            if !focused {
                if angle > half_peripheral {
                    continue;
                }
                // Falls off linearly toward the edge of the peripheral cone
                let span = (half_peripheral - half_fov).max(f32::EPSILON);
                let chance = self.config.peripheral_sensitivity * (1.0 - (angle - half_fov) / span);
                if rng.gen::<f32>() >= chance {
                    continue;
                }
            }

            let tr = world.trace_line(me.eye, target, Some(me.id), ContentMask::SHOT);
            if tr.fraction < LOS_MIN_FRACTION && tr.hit_entity != Some(e.id) {
                continue;
            }

            let distance = dist_sq.sqrt();
            let visibility = self.visibility_confidence(category, distance, e.velocity.length(), focused);
            let is_enemy = category == EntityCategory::Player && me.team.is_enemy_of(e.team);
            let is_ally = category == EntityCategory::Player && !is_enemy && e.team != Team::Spectator;

            self.visible.push(EntityInfo {
                id: e.id,
                category,
                kind: e.kind,
                position: e.position,
                velocity: e.velocity,
                view_dir: e.view_dir(),
                distance,
                visibility,
                threat_score: 0.0,
                is_enemy,
                is_ally,
                health: e.health,
                armor: e.armor,
                weapon: e.weapon,
                focused,
                seen_at: now,
            });
        }
    }

    /// Distance falloff times motion bonus times apparent size, clamped to [0, 1]
    fn visibility_confidence(&self, category: EntityCategory, distance: f32, speed: f32, focused: bool) -> f32 {
        let falloff = 1.0 - 0.5 * (distance / self.config.vision_range.max(1.0)).min(1.0);
        let motion = 1.0 + 0.2 * (speed / MOTION_REFERENCE_SPEED).min(1.0);
        let lighting = 1.0;
        let peripheral = if focused { 1.0 } else { 0.7 };
        (falloff * motion * category.size_factor() * lighting * peripheral).clamp(0.0, 1.0)
    }

    fn merge_memory(&mut self, now: f32) {
        for info in &self.visible {
            if let Some(entry) = self.memory.iter_mut().find(|m| m.info.id == info.id) {
                entry.info = info.clone();
                entry.last_seen = now;
                entry.last_decay = now;
                entry.confidence = 1.0;
                continue;
            }
            if self.memory.len() >= MAX_MEMORY_ENTRIES {
                // Evict the stalest entry
                if let Some(oldest) = self
                    .memory
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1.last_seen.total_cmp(&b.1.last_seen))
                    .map(|(i, _)| i)
                {
                    self.memory.swap_remove(oldest);
                }
            }
            self.memory.push(MemoryEntry {
                info: info.clone(),
                last_seen: now,
                confidence: 1.0,
                last_decay: now,
            });
        }
        self.decay_memory(now);
    }

    /// Decay unobserved entries by `decay_rate^elapsed` and purge forgotten ones
    pub fn decay_memory(&mut self, now: f32) {
        let rate = self.config.decay_rate;
        for entry in &mut self.memory {
            let elapsed = now - entry.last_decay;
            if elapsed > 0.0 {
                entry.confidence *= rate.powf(elapsed);
                entry.last_decay = now;
            }
        }
        self.memory
            .retain(|m| m.confidence >= MEMORY_MIN_CONFIDENCE && now - m.last_seen <= MEMORY_MAX_AGE);
    }

    fn update_hearing<W: World + ?Sized>(&mut self, world: &W, now: f32) {
        let me = self.self_state.clone();
        for e in world.entities() {
            if !e.is_alive_player() || e.id == me.id || e.events.is_empty() {
                continue;
            }
            if now - e.event_time > SOUND_EVENT_WINDOW {
                continue;
            }
            let Some(kind) = SoundKind::from_events(e.events) else {
                continue;
            };
            if self.sounds.iter().any(|s| s.source == e.id && s.time == e.event_time && s.kind == kind) {
                continue;
            }
            let distance = me.eye.distance_to(e.position);
            if distance > self.config.hearing_range {
                continue;
            }
            let mut volume = kind.base_volume() * (1.0 - distance / self.config.hearing_range);
            let tr = world.trace_line(me.eye, e.eye(), Some(me.id), ContentMask::SOLID);
            if tr.hit() {
                volume *= OCCLUSION_FACTOR;
            }
            if volume < MIN_SOUND_VOLUME {
                continue;
            }
            let is_enemy = me.team.is_enemy_of(e.team);
            self.sounds.push(SoundEvent {
                source: e.id,
                position: e.position,
                kind,
                volume,
                time: e.event_time,
                is_enemy,
            });

            // Heard enemies nudge memory toward where the sound came from
            if is_enemy && self.visible_entity(e.id).is_none() {
                let confidence = (volume * 0.5).max(MEMORY_MIN_CONFIDENCE);
                let heard_score = threat_score(&ThreatFactors {
                    distance,
                    max_range: self.config.vision_range,
                    weapon_danger: e.weapon.stats().danger,
                    own_health: me.health,
                    visible: false,
                    can_hit_me: false,
                    can_i_hit: distance <= me.weapon.stats().max_range,
                    prior_damage: self.prior_damage(e.id, now),
                });
                if let Some(entry) = self.memory.iter_mut().find(|m| m.info.id == e.id) {
                    entry.info.position = e.position;
                    entry.confidence = entry.confidence.max(confidence);
                    entry.last_seen = now;
                    entry.last_decay = now;
                } else if self.memory.len() < MAX_MEMORY_ENTRIES {
                    self.memory.push(MemoryEntry {
                        info: EntityInfo {
                            id: e.id,
                            category: EntityCategory::Player,
                            kind: e.kind,
                            position: e.position,
                            velocity: Vec3::ZERO,
                            view_dir: e.view_dir(),
                            distance,
                            visibility: 0.0,
                            threat_score: heard_score,
                            is_enemy: true,
                            is_ally: false,
                            health: e.health,
                            armor: e.armor,
                            weapon: e.weapon,
                            focused: false,
                            seen_at: now,
                        },
                        last_seen: now,
                        confidence,
                        last_decay: now,
                    });
                }
            }
        }
    }

    fn assess_threats(&mut self, now: f32) {
        let me = self.self_state.clone();
        let my_range = me.weapon.stats().max_range;
        let facing_cos = FACING_HALF_ANGLE.cos();

        let mut scored: SmallVec<[(EntityId, f32, Vec3); 8]> = SmallVec::new();
        for i in 0..self.visible.len() {
            if !self.visible[i].is_enemy {
                continue;
            }
            let info = &self.visible[i];
            let to_me = (me.position - info.position).normalize();
            let can_hit_me =
                info.distance <= info.weapon.stats().max_range && info.view_dir.dot(to_me) >= facing_cos;
            let factors = ThreatFactors {
                distance: info.distance,
                max_range: self.config.vision_range,
                weapon_danger: info.weapon.stats().danger,
                own_health: me.health,
                visible: true,
                can_hit_me,
                can_i_hit: info.distance <= my_range,
                prior_damage: self.prior_damage(info.id, now),
            };
            let score = threat_score(&factors);
            self.visible[i].threat_score = score;
            scored.push((self.visible[i].id, score, self.visible[i].position));
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let under_fire = self
            .threats
            .last_damage_time
            .map_or(false, |t| now - t <= UNDER_FIRE_WINDOW);

        let mut flanked = false;
        for (i, a) in scored.iter().enumerate() {
            for b in scored.iter().skip(i + 1) {
                let da = (a.2 - me.position).flat();
                let db = (b.2 - me.position).flat();
                if da.angle_between(db) > FLANK_SEPARATION {
                    flanked = true;
                }
            }
        }

        let threat_center = if scored.is_empty() {
            None
        } else {
            let sum = scored.iter().fold(Vec3::ZERO, |acc, t| acc + t.2);
            Some(sum * (1.0 / scored.len() as f32))
        };

        self.threats = ThreatAssessment {
            primary: scored.first().map(|t| t.0),
            secondary: scored.get(1).map(|t| t.0),
            primary_score: scored.first().map_or(0.0, |t| t.1),
            level: scored.first().map_or(ThreatLevel::Low, |t| ThreatLevel::from_score(t.1)),
            threat_count: scored.len(),
            threat_center,
            flanked,
            outnumbered: scored.len() > OUTNUMBERED_THREATS,
            under_fire,
            last_damage_time: self.threats.last_damage_time,
        };
    }

    fn update_spatial<W: World + ?Sized>(&mut self, world: &W) {
        let origin = self.self_state.position;
        let mut nearest = SPATIAL_PROBE_DISTANCE;
        let mut nearest_dir = Vec3::ZERO;
        let mut fractions = [0.0f32; 8];
        let mut dirs = [Vec3::ZERO; 8];
        for (k, (fraction, dir)) in fractions.iter_mut().zip(dirs.iter_mut()).enumerate() {
            *dir = Vec3::from_yaw(k as f32 * 45.0);
            let end = origin + *dir * SPATIAL_PROBE_DISTANCE;
            let tr = world.trace_line(origin, end, Some(self.self_state.id), ContentMask::SOLID);
            *fraction = tr.fraction;
            let d = tr.fraction * SPATIAL_PROBE_DISTANCE;
            if d < nearest {
                nearest = d;
                nearest_dir = *dir;
            }
        }
        let open_ratio = fractions.iter().sum::<f32>() / fractions.len() as f32;
        let boxed_in = open_ratio < BOXED_IN_RATIO;

        let escape_direction = if boxed_in {
            let away = self.threats.threat_center.map(|c| (c - origin).flat().normalize());
            fractions
                .iter()
                .zip(dirs.iter())
                .map(|(&f, &d)| {
                    let toward_threat = away.map_or(0.0, |t| d.dot(t).max(0.0));
                    (f - 0.5 * toward_threat, d)
                })
                .filter(|(score, _)| *score > 0.0)
                .max_by(|a, b| a.0.total_cmp(&b.0))
                .map(|(_, d)| d)
        } else {
            None
        };

        let high_ground = self
            .threats
            .threat_center
            .map_or(false, |c| origin.z - c.z > HIGH_GROUND_DELTA);

        self.spatial = SpatialAwareness {
            nearest_wall_distance: nearest,
            nearest_wall_direction: nearest_dir,
            open_ratio,
            boxed_in,
            escape_direction,
            high_ground,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::brush::standing_player;
    use crate::world::BrushWorld;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn wide_open() -> PerceptionConfig {
        PerceptionConfig {
            fov_degrees: 360.0,
            peripheral_degrees: 360.0,
            ..Default::default()
        }
    }

    // ========================================================================
    // Vision
    // ========================================================================

    #[test]
    fn test_sees_enemy_in_front() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        let enemy = world.spawn(standing_player(0, 400.0, 0.0, Team::Blue));

        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());

        let seen = p.visible_entity(enemy).expect("enemy should be visible");
        assert!(seen.is_enemy);
        assert!(seen.focused);
        assert!(seen.visibility > 0.0 && seen.visibility <= 1.0);
        assert_eq!(p.threats().primary, Some(enemy));
        assert!(p.recall(enemy).is_some());
    }

    #[test]
    fn test_memory_keeps_threat_score() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        let enemy = world.spawn(standing_player(0, 400.0, 0.0, Team::Blue));

        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());

        let seen = p.visible_entity(enemy).expect("visible").threat_score;
        let remembered = p.recall(enemy).expect("remembered").info.threat_score;
        assert!(seen > 0.0);
        assert_eq!(remembered, seen);
    }

    #[test]
    fn test_wall_blocks_vision() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        world.add_box(Vec3::new(180.0, -200.0, 0.0), Vec3::new(220.0, 200.0, 200.0));
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        let enemy = world.spawn(standing_player(0, 400.0, 0.0, Team::Blue));

        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());
        assert!(p.visible_entity(enemy).is_none());
        assert_eq!(p.threats().threat_count, 0);
    }

    #[test]
    fn test_behind_and_out_of_range_not_seen() {
        let mut world = BrushWorld::arena(3000.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        let behind = world.spawn(standing_player(0, -300.0, 0.0, Team::Blue));
        let far = world.spawn(standing_player(0, 2500.0, 0.0, Team::Blue));

        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());
        assert!(p.visible_entity(behind).is_none());
        assert!(p.visible_entity(far).is_none());
    }

    #[test]
    fn test_visible_cap() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        for i in 0..40 {
            world.spawn(EntityState::item(0, EntityKind::Health, Vec3::new(100.0 + i as f32 * 10.0, 0.0, 16.0)));
        }
        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());
        assert_eq!(p.visible().len(), MAX_VISIBLE_ENTITIES);
    }

    #[test]
    fn test_no_entities_still_updates() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Free));
        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());

        assert!(p.visible().is_empty());
        assert_eq!(p.threats().primary, None);
        assert_eq!(p.threats().level, ThreatLevel::Low);
        assert!(!p.spatial().boxed_in);
        assert!(p.self_state().alive);
    }

    // ========================================================================
    // Memory
    // ========================================================================

    #[test]
    fn test_memory_decays_and_purges() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        let enemy = world.spawn(standing_player(0, 400.0, 0.0, Team::Blue));

        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());
        assert_eq!(p.recall(enemy).map(|m| m.confidence), Some(1.0));

        p.decay_memory(1.0);
        let c1 = p.recall(enemy).map(|m| m.confidence).unwrap_or(0.0);
        assert!((c1 - 0.8).abs() < 1e-4);

        p.decay_memory(2.0);
        let c2 = p.recall(enemy).map(|m| m.confidence).unwrap_or(0.0);
        assert!(c2 < c1);

        // 0.8^11 < 0.1
        p.decay_memory(11.0);
        assert!(p.recall(enemy).is_none());
    }

    #[test]
    fn test_memory_max_age() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        let enemy = world.spawn(standing_player(0, 400.0, 0.0, Team::Blue));

        let mut p = PerceptionSystem::new(PerceptionConfig {
            decay_rate: 1.0,
            ..Default::default()
        });
        p.update(&world, me, &mut rng());
        p.decay_memory(9.5);
        assert!(p.recall(enemy).is_some());
        p.decay_memory(10.5);
        assert!(p.recall(enemy).is_none());
    }

    #[test]
    fn test_enemy_remembered_after_leaving_view() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        let enemy = world.spawn(standing_player(0, 400.0, 0.0, Team::Blue));

        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());

        if let Some(e) = world.entity_mut(enemy) {
            e.position = Vec3::new(-400.0, 0.0, 24.0);
        }
        world.advance(0.5);
        p.update(&world, me, &mut rng());

        assert!(p.visible_entity(enemy).is_none());
        let remembered = p.best_enemy_memory().expect("memory");
        assert_eq!(remembered.info.id, enemy);
        assert!(remembered.confidence < 1.0);
        // Position is the last seen one
        assert!((remembered.info.position.x - 400.0).abs() < 1e-3);
    }

    // ========================================================================
    // Hearing
    // ========================================================================

    #[test]
    fn test_hears_gunfire_behind() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        let mut shooter = standing_player(0, -300.0, 0.0, Team::Blue);
        shooter.events = EntityEvents::FIRED;
        let shooter = world.spawn(shooter);

        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());

        let sound = p.sounds().next().copied().expect("sound");
        assert_eq!(sound.source, shooter);
        assert_eq!(sound.kind, SoundKind::Weapon);
        assert!(sound.is_enemy);
        assert!(sound.volume > 0.7);
        assert!(p.recall(shooter).is_some());

        // Same event is not recorded twice
        world.advance(0.25);
        p.update(&world, me, &mut rng());
        assert_eq!(p.sounds().count(), 1);
    }

    #[test]
    fn test_occluded_sound_is_quieter() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        world.add_box(Vec3::new(-200.0, -100.0, 0.0), Vec3::new(-160.0, 100.0, 200.0));
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        let mut shooter = standing_player(0, -300.0, 0.0, Team::Blue);
        shooter.events = EntityEvents::FIRED;
        world.spawn(shooter);

        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());
        let volume = p.sounds().next().map(|s| s.volume).unwrap_or(0.0);
        let open = 1.0 - 300.0 / DEFAULT_HEARING_RANGE;
        assert!((volume - open * OCCLUSION_FACTOR).abs() < 0.02);
    }

    // ========================================================================
    // Threats
    // ========================================================================

    #[test]
    fn test_threat_level_bands() {
        assert_eq!(ThreatLevel::from_score(0.0), ThreatLevel::Low);
        assert_eq!(ThreatLevel::from_score(19.99), ThreatLevel::Low);
        assert_eq!(ThreatLevel::from_score(20.0), ThreatLevel::Medium);
        assert_eq!(ThreatLevel::from_score(40.0), ThreatLevel::High);
        assert_eq!(ThreatLevel::from_score(60.0), ThreatLevel::Critical);
        assert_eq!(ThreatLevel::from_score(500.0), ThreatLevel::Critical);
    }

    #[test]
    fn test_threat_score_components() {
        let base = ThreatFactors {
            distance: 1000.0,
            max_range: 2000.0,
            weapon_danger: 0.8,
            own_health: 100,
            visible: false,
            can_hit_me: false,
            can_i_hit: false,
            prior_damage: 0.0,
        };
        let s0 = threat_score(&base);
        assert!((s0 - (15.0 + 20.0)).abs() < 1e-4);

        let hurt = ThreatFactors { own_health: 50, ..base };
        assert!(threat_score(&hurt) > s0);

        let aiming = ThreatFactors { can_hit_me: true, ..base };
        assert!((threat_score(&aiming) - s0 - CAN_HIT_ME_BONUS).abs() < 1e-4);

        let big_damage = ThreatFactors { prior_damage: 1000.0, ..base };
        assert!((threat_score(&big_damage) - s0 - PRIOR_DAMAGE_CAP).abs() < 1e-4);
    }

    #[test]
    fn test_flanked_and_outnumbered() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        world.spawn(standing_player(0, 300.0, 0.0, Team::Blue));
        world.spawn(standing_player(0, -300.0, 0.0, Team::Blue));
        world.spawn(standing_player(0, 0.0, 300.0, Team::Blue));

        let mut p = PerceptionSystem::new(wide_open());
        p.update(&world, me, &mut rng());
        let t = p.threats();
        assert_eq!(t.threat_count, 3);
        assert!(t.flanked);
        assert!(t.outnumbered);
        assert!(t.secondary.is_some());
    }

    #[test]
    fn test_not_flanked_when_grouped() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        world.spawn(standing_player(0, 300.0, -50.0, Team::Blue));
        world.spawn(standing_player(0, 300.0, 50.0, Team::Blue));

        let mut p = PerceptionSystem::new(wide_open());
        p.update(&world, me, &mut rng());
        assert!(!p.threats().flanked);
        assert!(!p.threats().outnumbered);
    }

    #[test]
    fn test_health_loss_sets_under_fire() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());
        assert!(!p.threats().under_fire);

        if let Some(e) = world.entity_mut(me) {
            e.health = 70;
        }
        world.advance(0.05);
        p.update(&world, me, &mut rng());
        assert!(p.threats().under_fire);

        world.advance(1.5);
        p.update(&world, me, &mut rng());
        assert!(!p.threats().under_fire);
    }

    // ========================================================================
    // Spatial awareness
    // ========================================================================

    #[test]
    fn test_boxed_in_finds_open_side() {
        let mut world = BrushWorld::arena(512.0, 256.0);
        world.add_box(Vec3::new(32.0, -64.0, 0.0), Vec3::new(64.0, 64.0, 128.0));
        world.add_box(Vec3::new(-64.0, -64.0, 0.0), Vec3::new(-32.0, 64.0, 128.0));
        world.add_box(Vec3::new(-64.0, -64.0, 0.0), Vec3::new(64.0, -32.0, 128.0));
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Free));

        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());
        let s = p.spatial();
        assert!(s.boxed_in, "open ratio {}", s.open_ratio);
        assert!(s.nearest_wall_distance < 40.0);
        let escape = s.escape_direction.expect("escape direction");
        assert!(escape.y > 0.9);
    }

    #[test]
    fn test_open_floor_not_boxed_in() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Free));
        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut rng());
        assert!((p.spatial().open_ratio - 1.0).abs() < 1e-4);
        assert!(p.spatial().escape_direction.is_none());
    }
}
