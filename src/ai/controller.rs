//! Per-bot controller
//!
//! A [`BotController`] owns every per-bot subsystem and runs the think
//! pipeline: perception, threat ranking, combat decision and state, goal
//! selection, movement, aim, and finally one [`UserCmd`].

use std::collections::BTreeMap;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::ai::character::{CharacterProfile, Personality};
use crate::ai::combat::{
    calculate_aim_point, select_weapon, CombatDecision, CombatSituation, CombatState, TacticalCombat, ThreatInfo,
};
use crate::ai::constants::bot::{
    DAMAGE_HISTORY_CAPACITY, DEFAULT_THINK_TIME, ENEMY_MEMORY_CAPACITY, FIRE_ANGLE_TOLERANCE, ITEM_MEMORY_CAPACITY,
    MAX_CLIENTS, MAX_TURN_RATE, MIN_TURN_RATE, NEEDS_HEALTH, SPAWN_SETTLE_TIME, VISITED_CAPACITY, VISITED_SPACING,
};
use crate::ai::constants::combat::FEATURE_COUNT;
use crate::ai::constants::movement::WAYPOINT_REACHED;
use crate::ai::cover::{CoverId, CoverManager, CoverParams, CoverType};
use crate::ai::detail;
use crate::ai::movement::{avoid_obstacles, MoveIntent, MovementState, MovementTactics};
use crate::ai::neural::NetworkError;
use crate::ai::perception::{EntityCategory, PerceptionConfig, PerceptionSystem, SelfState};
use crate::ai::ppo::{ActionSample, Experience, PpoAgent, PpoConfig, RewardBreakdown, TrainingStats};
use crate::ai::skill::{AdaptationState, SkillProfile};
use crate::ai::team::{Order, RequestKind};
use crate::ai::weapons::{Inventory, Weapon};
use crate::util::ring::RingBuffer;
use crate::util::vec3::Vec3;
use crate::util::wrap_degrees;
use crate::world::{Buttons, EntityId, EntityKind, EntityState, Team, UserCmd, World};

/// Policy actions when learning: 0 keeps the network decision, the rest
/// force one tactical flag
pub const POLICY_ACTIONS: usize = 5;

/// Distance at which a button goal is pressed
const USE_RANGE: f32 = 64.0;

/// Validated client slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u8);

impl ClientId {
    pub fn new(index: usize) -> Option<Self> {
        (index < MAX_CLIENTS).then_some(Self(index as u8))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Client slots map onto the low entity ids
    #[inline]
    pub fn entity(self) -> EntityId {
        self.0 as EntityId
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BotState {
    #[default]
    Spawning,
    Idle,
    Combat,
    Moving,
    Searching,
    Retreating,
    Objective,
    Dead,
}

/// Goal weights, each 0..1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Goals {
    pub combat: f32,
    pub item: f32,
    pub exploration: f32,
    pub objective: f32,
}

impl Default for Goals {
    fn default() -> Self {
        Personality::Balanced.goals()
    }
}

/// What the bot is working toward outside of a fight
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum CurrentGoal {
    #[default]
    None,
    Item { entity: EntityId, position: Vec3, priority: f32 },
    Enemy { entity: EntityId, position: Vec3, priority: f32 },
    Position { position: Vec3, priority: f32 },
    /// Walk up to something and press use
    Button { position: Vec3, priority: f32 },
    Objective { position: Vec3, priority: f32 },
}

impl CurrentGoal {
    pub fn position(&self) -> Option<Vec3> {
        match *self {
            CurrentGoal::None => None,
            CurrentGoal::Item { position, .. }
            | CurrentGoal::Enemy { position, .. }
            | CurrentGoal::Position { position, .. }
            | CurrentGoal::Button { position, .. }
            | CurrentGoal::Objective { position, .. } => Some(position),
        }
    }

    pub fn priority(&self) -> f32 {
        match *self {
            CurrentGoal::None => 0.0,
            CurrentGoal::Item { priority, .. }
            | CurrentGoal::Enemy { priority, .. }
            | CurrentGoal::Position { priority, .. }
            | CurrentGoal::Button { priority, .. }
            | CurrentGoal::Objective { priority, .. } => priority,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnemySighting {
    pub position: Vec3,
    pub time: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DamageRecord {
    pub attacker: Option<EntityId>,
    pub amount: i32,
    pub time: f32,
}

/// Long-lived per-bot memory, separate from perception's decaying memory
#[derive(Debug, Clone)]
pub struct BotMemory {
    enemies: BTreeMap<EntityId, EnemySighting>,
    items: BTreeMap<EntityId, (EntityKind, Vec3)>,
    visited: RingBuffer<Vec3>,
    damage: RingBuffer<DamageRecord>,
}

impl Default for BotMemory {
    fn default() -> Self {
        Self {
            enemies: BTreeMap::new(),
            items: BTreeMap::new(),
            visited: RingBuffer::new(VISITED_CAPACITY),
            damage: RingBuffer::new(DAMAGE_HISTORY_CAPACITY),
        }
    }
}

impl BotMemory {
    /// Remember where an enemy was; the stalest sighting goes when full
    pub fn record_enemy(&mut self, id: EntityId, position: Vec3, time: f32) {
        if !self.enemies.contains_key(&id) && self.enemies.len() >= ENEMY_MEMORY_CAPACITY {
            let stalest = self
                .enemies
                .iter()
                .min_by(|a, b| a.1.time.total_cmp(&b.1.time))
                .map(|(id, _)| *id);
            if let Some(old) = stalest {
                self.enemies.remove(&old);
            }
        }
        self.enemies.insert(id, EnemySighting { position, time });
    }

    pub fn enemy(&self, id: EntityId) -> Option<&EnemySighting> {
        self.enemies.get(&id)
    }

    pub fn latest_enemy(&self) -> Option<(EntityId, EnemySighting)> {
        self.enemies
            .iter()
            .max_by(|a, b| a.1.time.total_cmp(&b.1.time))
            .map(|(id, s)| (*id, *s))
    }

    /// New items past capacity are ignored
    pub fn record_item(&mut self, id: EntityId, kind: EntityKind, position: Vec3) {
        if self.items.contains_key(&id) || self.items.len() < ITEM_MEMORY_CAPACITY {
            self.items.insert(id, (kind, position));
        }
    }

    pub fn forget_item(&mut self, id: EntityId) {
        self.items.remove(&id);
    }

    pub fn items(&self) -> impl Iterator<Item = (EntityId, EntityKind, Vec3)> + '_ {
        self.items.iter().map(|(id, (kind, pos))| (*id, *kind, *pos))
    }

    /// Record a visited position unless it is close to the last one
    pub fn record_visit(&mut self, position: Vec3) -> bool {
        if self.visited.newest().is_some_and(|p| p.distance_to(position) < VISITED_SPACING) {
            return false;
        }
        self.visited.push(position);
        true
    }

    pub fn visited(&self) -> impl Iterator<Item = &Vec3> {
        self.visited.iter()
    }

    pub fn record_damage(&mut self, attacker: Option<EntityId>, amount: i32, time: f32) {
        self.damage.push(DamageRecord { attacker, amount, time });
    }

    pub fn damage_since(&self, since: f32) -> i32 {
        self.damage.iter().filter(|d| d.time >= since).map(|d| d.amount).sum()
    }

    pub fn last_attacker(&self) -> Option<EntityId> {
        self.damage.iter().rev().find_map(|d| d.attacker)
    }

    /// Point of a 3x3 grid over the map farthest from anything visited
    pub fn exploration_target(&self, bounds: (Vec3, Vec3), from: Vec3) -> Vec3 {
        let (lo, hi) = bounds;
        let mut best = (f32::MIN, from);
        for gx in 0..3 {
            for gy in 0..3 {
                let p = Vec3::new(
                    lo.x + (hi.x - lo.x) * (gx as f32 + 0.5) / 3.0,
                    lo.y + (hi.y - lo.y) * (gy as f32 + 0.5) / 3.0,
                    from.z,
                );
                let novelty = self
                    .visited
                    .iter()
                    .chain(std::iter::once(&from))
                    .map(|v| v.flat().distance_to(p.flat()))
                    .fold(f32::MAX, f32::min);
                if novelty > best.0 {
                    best = (novelty, p);
                }
            }
        }
        best.1
    }

    /// Forget fight-specific memory on respawn
    pub fn clear_combat(&mut self) {
        self.enemies.clear();
        self.damage.clear();
    }
}

/// Per-bot knobs taken from the AI configuration
#[derive(Debug, Clone, Copy)]
pub struct BotSettings {
    pub think_interval: f32,
    pub learning: bool,
    pub perception: PerceptionConfig,
    pub debug_cover: bool,
    pub debug_movement: bool,
    pub debug_combat: bool,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            think_interval: DEFAULT_THINK_TIME,
            learning: false,
            perception: PerceptionConfig::default(),
            debug_cover: false,
            debug_movement: false,
            debug_combat: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BotStats {
    pub kills: u32,
    pub deaths: u32,
    pub damage_dealt: i32,
    pub damage_taken: i32,
    pub thinks: u64,
}

/// Side effects of one think the owner applies after the fact
#[derive(Debug, Clone, Default)]
pub struct ThinkOutcome {
    pub cmd: UserCmd,
    pub claim_cover: Option<CoverId>,
    pub release_cover: bool,
    pub transition: Option<(BotState, BotState)>,
    /// Enemies seen this think, for the team picture
    pub sightings: SmallVec<[(EntityId, Vec3, Weapon); 4]>,
    pub request: Option<(RequestKind, Vec3)>,
    pub training: Option<TrainingStats>,
}

#[derive(Debug, Clone)]
pub struct BotController {
    client: ClientId,
    character: CharacterProfile,
    team: Team,
    settings: BotSettings,
    state: BotState,
    previous_state: BotState,
    state_entered: f32,
    perception: PerceptionSystem,
    combat: TacticalCombat,
    movement: MovementTactics,
    cover: Option<CoverId>,
    skill: SkillProfile,
    adaptation: AdaptationState,
    ppo: Option<PpoAgent>,
    pending_step: Option<(Vec<f32>, ActionSample)>,
    pending_reward: RewardBreakdown,
    memory: BotMemory,
    goals: Goals,
    current_goal: CurrentGoal,
    order: Option<Order>,
    cmd: UserCmd,
    next_think: f32,
    last_think: Option<f32>,
    aim_target: Option<EntityId>,
    reaction_ready_at: f32,
    last_request: f32,
    stats: BotStats,
    rng: StdRng,
}

impl BotController {
    pub fn new(
        client: ClientId,
        character: CharacterProfile,
        team: Team,
        settings: BotSettings,
        seed: u64,
    ) -> Result<Self, NetworkError> {
        let mut rng = StdRng::seed_from_u64(seed ^ (client.index() as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let personality = character.personality;

        let mut combat = TacticalCombat::new(personality.combat_style(), &mut rng)?;
        combat.debug = settings.debug_combat;
        let mut movement = MovementTactics::new(personality.movement_style(), character.skill);
        movement.debug = settings.debug_movement;

        let mut skill = SkillProfile::new(character.skill);
        apply_character(&mut skill, &character);

        let ppo = if settings.learning {
            Some(PpoAgent::new(FEATURE_COUNT, POLICY_ACTIONS, &[32, 32], PpoConfig::default(), &mut rng)?)
        } else {
            None
        };

        Ok(Self {
            client,
            team,
            settings,
            state: BotState::Spawning,
            previous_state: BotState::Spawning,
            state_entered: 0.0,
            perception: PerceptionSystem::new(settings.perception),
            combat,
            movement,
            cover: None,
            skill,
            adaptation: AdaptationState::default(),
            ppo,
            pending_step: None,
            pending_reward: RewardBreakdown::default(),
            memory: BotMemory::default(),
            goals: personality.goals(),
            current_goal: CurrentGoal::None,
            order: None,
            cmd: UserCmd::default(),
            next_think: 0.0,
            last_think: None,
            aim_target: None,
            reaction_ready_at: 0.0,
            last_request: f32::MIN,
            stats: BotStats::default(),
            rng,
            character,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn name(&self) -> &str {
        &self.character.name
    }

    pub fn character(&self) -> &CharacterProfile {
        &self.character
    }

    pub fn personality(&self) -> Personality {
        self.character.personality
    }

    pub fn team(&self) -> Team {
        self.team
    }

    pub fn state(&self) -> BotState {
        self.state
    }

    pub fn previous_state(&self) -> BotState {
        self.previous_state
    }

    pub fn state_entered(&self) -> f32 {
        self.state_entered
    }

    pub fn perception(&self) -> &PerceptionSystem {
        &self.perception
    }

    pub fn combat(&self) -> &TacticalCombat {
        &self.combat
    }

    pub fn movement(&self) -> &MovementTactics {
        &self.movement
    }

    pub fn cover(&self) -> Option<CoverId> {
        self.cover
    }

    pub fn skill(&self) -> &SkillProfile {
        &self.skill
    }

    /// Skill profile and opponent state together, as difficulty adjustment needs both
    pub fn skill_parts_mut(&mut self) -> (&mut SkillProfile, &mut AdaptationState) {
        (&mut self.skill, &mut self.adaptation)
    }

    pub fn set_skill(&mut self, skill: SkillProfile) {
        self.skill = skill;
    }

    pub fn adaptation(&self) -> &AdaptationState {
        &self.adaptation
    }

    pub fn ppo(&self) -> Option<&PpoAgent> {
        self.ppo.as_ref()
    }

    pub fn ppo_mut(&mut self) -> Option<&mut PpoAgent> {
        self.ppo.as_mut()
    }

    pub fn memory(&self) -> &BotMemory {
        &self.memory
    }

    pub fn goals(&self) -> Goals {
        self.goals
    }

    pub fn current_goal(&self) -> CurrentGoal {
        self.current_goal
    }

    /// Hand the bot a goal from outside, e.g. a button to press
    pub fn set_goal(&mut self, goal: CurrentGoal) {
        self.current_goal = goal;
    }

    pub fn order(&self) -> Option<Order> {
        self.order
    }

    pub fn set_order(&mut self, order: Option<Order>) {
        self.order = order;
    }

    pub fn last_cmd(&self) -> &UserCmd {
        &self.cmd
    }

    pub fn stats(&self) -> BotStats {
        self.stats
    }

    pub fn is_due(&self, now: f32) -> bool {
        now >= self.next_think
    }

    /// Drop the cover reference after the owner refused the claim
    pub fn cover_denied(&mut self) {
        self.cover = None;
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn on_damaged(&mut self, attacker: Option<EntityId>, amount: i32, now: f32) {
        self.memory.record_damage(attacker, amount, now);
        if let Some(a) = attacker {
            self.perception.record_damage(a, amount as f32, now);
        }
        self.stats.damage_taken += amount;
        self.pending_reward.survival -= amount as f32 * 0.01;
    }

    pub fn on_damage_dealt(&mut self, amount: i32) {
        self.stats.damage_dealt += amount;
        self.pending_reward.combat += amount as f32 * 0.01;
    }

    pub fn on_shot(&mut self, hit: bool) {
        self.combat.record_shot(hit);
    }

    pub fn on_kill(&mut self) {
        self.stats.kills += 1;
        self.adaptation.record_opponent_death();
        self.pending_reward.combat += 1.0;
    }

    pub fn on_death(&mut self) {
        self.stats.deaths += 1;
        self.adaptation.record_opponent_kill();
        self.pending_reward.survival -= 1.0;
    }

    /// An opponent fired at this bot
    pub fn on_shot_at(&mut self, hit: bool) {
        self.adaptation.record_opponent_shot(hit);
    }

    // ========================================================================
    // Think
    // ========================================================================

    /// One decision cycle. Reads the world and the shared cover set; every
    /// shared-state change is returned in the outcome.
    pub fn think<W: World + ?Sized>(&mut self, world: &W, cover: &CoverManager, now: f32) -> ThinkOutcome {
        let mut out = ThinkOutcome::default();
        let dt = self.last_think.map_or(self.settings.think_interval, |t| (now - t).max(0.0));
        self.last_think = Some(now);
        self.next_think = now + self.settings.think_interval;
        self.stats.thinks += 1;
        self.skill.interpolate_level(dt);

        let id = self.client.entity();
        let entity = world.entity(id).filter(|e| e.is_alive_player());
        if entity.is_some() && self.state == BotState::Dead {
            self.respawned(now, &mut out);
        }
        self.perception.update(world, id, &mut self.rng);

        let Some(entity) = entity else {
            self.died(now, &mut out);
            out.cmd = self.cmd;
            return out;
        };
        let me = self.perception.self_state().clone();

        if self.state == BotState::Spawning && now - self.state_entered < SPAWN_SETTLE_TIME {
            self.cmd = self.idle_cmd(&me, now);
            out.cmd = self.cmd;
            return out;
        }

        let ms = MovementState::from_entity(entity);
        self.observe(&me, now, &mut out);

        // Combat decision
        self.combat.update_threats(&self.perception, now);
        let threats = self.perception.threats().clone();
        let ammo = entity.inventory.ammo(me.weapon);
        let mut situation = CombatSituation {
            primary: self.combat.target().copied(),
            memory_age: self.perception.best_enemy_memory().map(|m| m.age(now)),
            health: me.health,
            under_fire: threats.under_fire,
            outnumbered: threats.outnumbered,
            weapon: me.weapon,
            time_in_combat: self.combat.time_in_combat(now),
            decision: None,
        };
        let features = self.combat.features(&situation, self.movement.dodge_success_rate(), ammo);
        match self.combat.make_decision(&features) {
            Ok(mut decision) => {
                self.apply_policy(&features, &mut decision, &mut out);
                situation.decision = Some(decision);
            }
            Err(e) => warn!(client = %self.client, error = %e, "Combat network failed"),
        }
        let combat_state = self.combat.update_state(&situation, now);

        // Goal and bot state
        self.current_goal = self.select_goal(world, &me, &entity.inventory, combat_state);
        let next = match combat_state {
            CombatState::Retreating => BotState::Retreating,
            CombatState::Searching => BotState::Searching,
            CombatState::Idle => match self.current_goal {
                CurrentGoal::Objective { .. } | CurrentGoal::Button { .. } => BotState::Objective,
                CurrentGoal::None => BotState::Idle,
                _ => BotState::Moving,
            },
            _ => BotState::Combat,
        };
        self.transition(next, now, &mut out);
        if !matches!(next, BotState::Combat | BotState::Retreating) && self.cover.take().is_some() {
            out.release_cover = true;
        }
        if threats.outnumbered && now - self.last_request > 5.0 {
            out.request = Some((RequestKind::Backup, me.position));
            self.last_request = now;
        }

        // Movement, aim, weapon
        let intent = self.decide_movement(world, cover, &ms, &me, combat_state, now, &mut out);
        let (angles, fire) = self.aim(&me, combat_state, &intent, dt, now);
        let weapon = self.choose_weapon(&entity.inventory, me.weapon);

        let mut buttons = Buttons::empty();
        if fire {
            buttons |= Buttons::ATTACK;
        }
        if intent.jump {
            buttons |= Buttons::JUMP;
        }
        if intent.crouch {
            buttons |= Buttons::CROUCH;
        }
        if intent.walk {
            buttons |= Buttons::WALK;
        }
        if let CurrentGoal::Button { position, .. } = self.current_goal {
            if position.distance_to(me.position) <= USE_RANGE {
                buttons |= Buttons::USE;
                self.current_goal = CurrentGoal::None;
            }
        }

        let mut cmd = UserCmd {
            server_time: millis(now),
            angles,
            buttons,
            weapon,
            ..Default::default()
        };
        let (forward, right) = intent.relative_to_yaw(angles.y);
        let up = if intent.jump {
            1.0
        } else if intent.crouch {
            -1.0
        } else {
            0.0
        };
        cmd.set_movement(forward, right, up);
        self.cmd = cmd;
        out.cmd = cmd;
        out
    }

    fn transition(&mut self, next: BotState, now: f32, out: &mut ThinkOutcome) {
        if next == self.state {
            return;
        }
        debug!(client = %self.client, name = %self.character.name, from = ?self.state, to = ?next, "Bot state change");
        out.transition = Some((self.state, next));
        self.previous_state = self.state;
        self.state = next;
        self.state_entered = now;
    }

    fn respawned(&mut self, now: f32, out: &mut ThinkOutcome) {
        self.perception.reset();
        self.combat.reset();
        self.movement.clear_path();
        self.movement.cancel_dodge();
        self.memory.clear_combat();
        self.current_goal = CurrentGoal::None;
        self.aim_target = None;
        self.transition(BotState::Spawning, now, out);
    }

    fn died(&mut self, now: f32, out: &mut ThinkOutcome) {
        if self.state != BotState::Dead {
            self.transition(BotState::Dead, now, out);
            out.release_cover = self.cover.take().is_some();
            self.movement.clear_path();
            self.movement.cancel_dodge();
            self.combat.reset();
        }
        self.finish_episode(&mut out.training);
        self.cmd = UserCmd {
            server_time: millis(now),
            angles: self.cmd.angles,
            weapon: self.cmd.weapon,
            ..Default::default()
        };
    }

    fn idle_cmd(&self, me: &SelfState, now: f32) -> UserCmd {
        UserCmd {
            server_time: millis(now),
            angles: me.angles,
            weapon: me.weapon,
            ..Default::default()
        }
    }

    /// Fold this think's perception into long-lived memory
    fn observe(&mut self, me: &SelfState, now: f32, out: &mut ThinkOutcome) {
        for info in self.perception.visible() {
            match info.category {
                EntityCategory::Player if info.is_enemy => {
                    self.memory.record_enemy(info.id, info.position, now);
                    if out.sightings.len() < out.sightings.inline_size() {
                        out.sightings.push((info.id, info.position, info.weapon));
                    }
                }
                EntityCategory::Item | EntityCategory::Powerup => {
                    self.memory.record_item(info.id, info.kind, info.position);
                }
                _ => {}
            }
        }
        // Items seen taken are forgotten when we get close and they are gone
        let gone: SmallVec<[EntityId; 4]> = self
            .memory
            .items()
            .filter(|(id, _, pos)| {
                pos.distance_to(me.position) < WAYPOINT_REACHED * 2.0 && self.perception.visible_entity(*id).is_none()
            })
            .map(|(id, _, _)| id)
            .collect();
        for id in gone {
            self.memory.forget_item(id);
        }
        if self.memory.record_visit(me.position) {
            self.pending_reward.movement += 0.01;
        }
    }

    /// Score the candidate goals and keep the best
    fn select_goal<W: World + ?Sized>(
        &self,
        world: &W,
        me: &SelfState,
        inventory: &Inventory,
        combat_state: CombatState,
    ) -> CurrentGoal {
        if let Some(t) = self.combat.target() {
            if !matches!(combat_state, CombatState::Idle | CombatState::Searching) {
                return CurrentGoal::Enemy {
                    entity: t.id,
                    position: t.position,
                    priority: self.goals.combat,
                };
            }
        }

        let mut best = match self.current_goal {
            // External button goals persist until pressed
            button @ CurrentGoal::Button { .. } => button,
            _ => CurrentGoal::None,
        };
        let mut consider = |goal: CurrentGoal| {
            if goal.priority() > best.priority() {
                best = goal;
            }
        };

        if combat_state == CombatState::Searching {
            if let Some(m) = self.perception.best_enemy_memory() {
                consider(CurrentGoal::Enemy {
                    entity: m.info.id,
                    position: m.info.position,
                    priority: self.goals.combat * m.confidence,
                });
            } else if let Some((id, s)) = self.memory.latest_enemy() {
                consider(CurrentGoal::Enemy {
                    entity: id,
                    position: s.position,
                    priority: self.goals.combat * 0.5,
                });
            }
        }

        if let Some(order) = self.order {
            let urgency = if matches!(order, Order::Retreat { .. }) { 0.5 } else { 0.0 };
            consider(CurrentGoal::Objective {
                position: order.position(),
                priority: self.goals.objective * self.skill.components.teamwork.max(0.3) + urgency,
            });
        }

        for (id, kind, position) in self.memory.items() {
            let need = item_need(kind, me, inventory);
            if need <= 0.0 {
                continue;
            }
            let distance = position.distance_to(me.position);
            consider(CurrentGoal::Item {
                entity: id,
                position,
                priority: self.goals.item * need / (1.0 + distance / 1000.0),
            });
        }

        consider(CurrentGoal::Position {
            position: self.memory.exploration_target(world.bounds(), me.position),
            priority: self.goals.exploration * 0.3,
        });
        best
    }

    #[allow(clippy::too_many_arguments)]
    fn decide_movement<W: World + ?Sized>(
        &mut self,
        world: &W,
        cover: &CoverManager,
        ms: &MovementState,
        me: &SelfState,
        combat_state: CombatState,
        now: f32,
        out: &mut ThinkOutcome,
    ) -> MoveIntent {
        if let Some(intent) = self.movement.update_dodge(now) {
            return intent;
        }
        match self.state {
            BotState::Combat | BotState::Retreating => {
                let threats = self.perception.threats();
                let Some(threat_pos) = self.combat.target().map(|t| t.position).or(threats.threat_center) else {
                    return MoveIntent::default();
                };
                let to_target = threat_pos - me.position;
                let under_fire = threats.under_fire;
                let escape = self.perception.spatial().escape_direction;

                let engagement = self.combat.style.engagement();
                if under_fire && self.rng.gen::<f32>() < engagement.dodge_probability {
                    let dir = to_target.normalize();
                    let kind = self.movement.select_dodge_type(ms, dir, &mut self.rng);
                    if self.movement.start_dodge(kind, ms, dir, now, &mut self.rng) {
                        if let Some(intent) = self.movement.update_dodge(now) {
                            return intent;
                        }
                    }
                }

                let wants_cover = self.state == BotState::Retreating
                    || combat_state == CombatState::Defending
                    || self.combat.last_decision().is_some_and(|d| d.take_cover);
                if wants_cover {
                    if let Some(intent) = self.seek_cover(world, cover, ms, me, threat_pos, now, out) {
                        return intent;
                    }
                }
                if self.state == BotState::Retreating {
                    let away = escape.unwrap_or(-to_target);
                    return MoveIntent::toward(avoid_obstacles(world, ms, away));
                }

                match combat_state {
                    CombatState::Flanking => {
                        if let Some(Order::Flank { position, .. }) = self.order {
                            return self.travel(world, ms, position, now);
                        }
                        let side = to_target.flat().normalize().perpendicular_xy();
                        let dir = to_target.flat().normalize() * 0.5 + side;
                        MoveIntent::toward(avoid_obstacles(world, ms, dir))
                    }
                    CombatState::Pursuing => self.travel(world, ms, threat_pos, now),
                    CombatState::Ambushing => MoveIntent {
                        crouch: true,
                        ..Default::default()
                    },
                    CombatState::Evading => {
                        let strafe = self.movement.strafe(world, ms, to_target, now, &mut self.rng);
                        let back = -to_target.flat().normalize() + strafe.direction;
                        MoveIntent::toward(avoid_obstacles(world, ms, back))
                    }
                    _ => {
                        let mut strafe = self.movement.strafe(world, ms, to_target, now, &mut self.rng);
                        strafe.direction = strafe.direction * engagement.strafe_speed;
                        strafe
                    }
                }
            }
            BotState::Moving | BotState::Objective | BotState::Searching => match self.current_goal.position() {
                Some(dest) => self.travel(world, ms, dest, now),
                None => MoveIntent::default(),
            },
            BotState::Spawning | BotState::Idle | BotState::Dead => MoveIntent::default(),
        }
    }

    /// Head for `dest`, with an advanced technique when one applies
    fn travel<W: World + ?Sized>(&mut self, world: &W, ms: &MovementState, dest: Vec3, now: f32) -> MoveIntent {
        let retarget = self
            .movement
            .current_waypoint()
            .map_or(true, |wp| wp.distance_to(dest) > WAYPOINT_REACHED);
        if retarget {
            self.movement.set_path(vec![dest], ms, now);
        }
        if (dest - ms.position).length_xy() > WAYPOINT_REACHED {
            let height = dest.z - ms.position.z;
            if let Some((technique, intent)) = self.movement.advanced_move(world, ms, dest - ms.position, height, now) {
                detail!(self.movement.debug, client = %self.client, ?technique, "Advanced movement");
                return intent;
            }
        }
        self.movement.follow_path(world, ms, now).unwrap_or_default()
    }

    #[allow(clippy::too_many_arguments)]
    fn seek_cover<W: World + ?Sized>(
        &mut self,
        world: &W,
        cover: &CoverManager,
        ms: &MovementState,
        me: &SelfState,
        threat: Vec3,
        now: f32,
        out: &mut ThinkOutcome,
    ) -> Option<MoveIntent> {
        if let Some(id) = self.cover {
            let Some(point) = cover.point(id) else {
                self.cover = None;
                return None;
            };
            if point.position.distance_to(ms.position) <= WAYPOINT_REACHED {
                return Some(MoveIntent {
                    crouch: point.cover_type == CoverType::Low,
                    ..Default::default()
                });
            }
            let target = point.position;
            return Some(self.travel(world, ms, target, now));
        }

        let params = CoverParams {
            urgency: (1.0 - me.health as f32 / 100.0).clamp(0.0, 1.0),
            min_threat_distance: 128.0,
            requester: Some(me.id),
            ..Default::default()
        };
        let eval = cover.find_best_cover(world, ms.position, threat, &params, now)?;
        let target = cover.point(eval.id)?.position;
        detail!(
            self.settings.debug_cover,
            client = %self.client,
            cover = eval.id.0,
            total = eval.total,
            "Moving to cover"
        );
        self.cover = Some(eval.id);
        out.claim_cover = Some(eval.id);
        Some(self.travel(world, ms, target, now))
    }

    /// Turn toward the aim point at a skill-limited rate. Returns the new
    /// view angles and whether to fire.
    fn aim(&mut self, me: &SelfState, combat_state: CombatState, intent: &MoveIntent, dt: f32, now: f32) -> (Vec3, bool) {
        let target: Option<ThreatInfo> = self.combat.target().copied().filter(|t| t.visible);
        let mut desired = match target {
            Some(t) => {
                if self.aim_target != Some(t.id) {
                    self.aim_target = Some(t.id);
                    self.reaction_ready_at = now + self.skill.reaction_delay();
                }
                let engagement = self.combat.style.engagement();
                let point = calculate_aim_point(
                    me.eye,
                    t.position + t.velocity * engagement.prediction_time,
                    t.velocity,
                    me.weapon,
                    self.skill.aim_accuracy() * engagement.aim_accuracy,
                    &mut self.rng,
                );
                let (pitch, yaw) = (point - me.eye).to_angles();
                Vec3::new(pitch, yaw, 0.0)
            }
            None => {
                self.aim_target = None;
                let dir = intent.direction.flat();
                if dir.is_zero(1e-3) {
                    me.angles
                } else {
                    Vec3::new(0.0, dir.to_angles().1, 0.0)
                }
            }
        };
        if let Some(pitch) = intent.pitch_override {
            desired.x = pitch;
        }

        let rate = MIN_TURN_RATE + (MAX_TURN_RATE - MIN_TURN_RATE) * self.skill.components.reaction.clamp(0.0, 1.0);
        let max_step = rate * dt.max(0.001);
        let current = me.angles;
        let yaw_step = wrap_degrees(desired.y - current.y).clamp(-max_step, max_step);
        let pitch_step = (desired.x - current.x).clamp(-max_step, max_step);
        let angles = Vec3::new(
            (current.x + pitch_step).clamp(-89.0, 89.0),
            wrap_degrees(current.y + yaw_step),
            0.0,
        );

        let error = wrap_degrees(desired.y - angles.y).abs().max((desired.x - angles.x).abs());
        let shooting_state = !matches!(combat_state, CombatState::Idle | CombatState::Searching);
        let wants_fire = match target {
            Some(t) => {
                shooting_state
                    && now >= self.reaction_ready_at
                    && error <= FIRE_ANGLE_TOLERANCE
                    && t.distance <= me.weapon.stats().max_range * 1.1
            }
            None => false,
        };
        let fire = self.combat.burst_allows(wants_fire, now);
        detail!(self.settings.debug_combat, client = %self.client, error, fire, "Aim");
        (angles, fire || intent.fire)
    }

    fn choose_weapon(&self, inventory: &Inventory, current: Weapon) -> Weapon {
        let style = self.combat.style;
        if let Some(t) = self.combat.target() {
            return select_weapon(inventory, t.distance, style);
        }
        match self.character.preferred_weapon {
            Some(w) if inventory.usable(w) => w,
            _ if inventory.usable(current) && current != Weapon::Gauntlet => current,
            _ => select_weapon(inventory, current.stats().optimal_range, style),
        }
    }

    // ========================================================================
    // Learning
    // ========================================================================

    /// Close the previous policy step and let the policy bias this decision
    fn apply_policy(&mut self, features: &[f32; FEATURE_COUNT], decision: &mut CombatDecision, out: &mut ThinkOutcome) {
        let Some(agent) = self.ppo.as_mut() else {
            return;
        };
        if let Some((state, sample)) = self.pending_step.take() {
            let experience = Experience {
                state,
                action: sample.action,
                reward: std::mem::take(&mut self.pending_reward),
                value: sample.value,
                log_prob: sample.log_prob,
                done: false,
                ..Default::default()
            };
            match agent.step(experience, features, &mut self.rng) {
                Ok(stats) => out.training = stats,
                Err(e) => warn!(client = %self.client, error = %e, "Policy update failed"),
            }
        }
        match agent.select_action(features, &mut self.rng) {
            Ok(sample) => {
                match sample.action {
                    1 => decision.take_cover = true,
                    2 => decision.flank = true,
                    3 => decision.retreat = true,
                    4 => decision.aggression = 1.0,
                    _ => {}
                }
                self.pending_step = Some((features.to_vec(), sample));
            }
            Err(e) => warn!(client = %self.client, error = %e, "Policy sampling failed"),
        }
    }

    /// Terminal step on death
    fn finish_episode(&mut self, training: &mut Option<TrainingStats>) {
        let Some(agent) = self.ppo.as_mut() else {
            return;
        };
        let Some((state, sample)) = self.pending_step.take() else {
            return;
        };
        let experience = Experience {
            state,
            action: sample.action,
            reward: std::mem::take(&mut self.pending_reward),
            value: sample.value,
            log_prob: sample.log_prob,
            done: true,
            ..Default::default()
        };
        match agent.step(experience, &[0.0; FEATURE_COUNT], &mut self.rng) {
            Ok(stats) => *training = stats,
            Err(e) => warn!(client = %self.client, error = %e, "Policy update failed"),
        }
    }
}

/// How much the bot wants an item right now, 0 when not at all
fn item_need(kind: EntityKind, me: &SelfState, inventory: &Inventory) -> f32 {
    match kind {
        EntityKind::Health => {
            let missing = (1.0 - me.health as f32 / 100.0).max(0.0);
            if me.health <= NEEDS_HEALTH {
                missing * 2.0
            } else {
                missing
            }
        }
        EntityKind::Armor => (1.0 - me.armor as f32 / 100.0).max(0.0) * 0.8,
        EntityKind::WeaponPickup(w) if !inventory.has(w) => w.tier() + 0.3,
        EntityKind::WeaponPickup(_) => 0.1,
        EntityKind::Ammo(w) if inventory.has(w) && inventory.ammo(w) < 10 => 0.5,
        EntityKind::Powerup => 1.0,
        _ => 0.0,
    }
}

/// Character numbers override the matching skill components. Built-in
/// characters map back onto their skill, so only file overrides change anything.
fn apply_character(skill: &mut SkillProfile, character: &CharacterProfile) {
    let (lo, hi) = (skill.min_skill, skill.max_skill);
    skill.components.aim = ((character.aim_accuracy - 0.3) / 0.6).clamp(lo, hi);
    skill.components.reaction = ((0.5 - character.reaction_time) / 0.35).clamp(lo, hi);
}

fn millis(now: f32) -> i32 {
    (now * 1000.0) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::brush::{standing_player, BrushWorld};

    fn bot(id: usize, personality: Personality) -> BotController {
        let character = CharacterProfile {
            personality,
            ..CharacterProfile::builtin("Test", 0.9)
        };
        BotController::new(
            ClientId::new(id).expect("slot"),
            character,
            Team::Red,
            BotSettings::default(),
            42,
        )
        .expect("controller")
    }

    fn duel() -> BrushWorld {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        world.insert_at(0, standing_player(0, 0.0, 0.0, Team::Red));
        world.insert_at(1, standing_player(1, 400.0, 0.0, Team::Blue));
        world
    }

    fn run(bot: &mut BotController, world: &mut BrushWorld, cover: &CoverManager, thinks: usize) -> Vec<ThinkOutcome> {
        (0..thinks)
            .map(|_| {
                world.advance(DEFAULT_THINK_TIME);
                let now = world.time();
                bot.think(&*world, cover, now)
            })
            .collect()
    }

    // ========================================================================
    // Identity and memory
    // ========================================================================

    #[test]
    fn test_client_id_bounds() {
        assert!(ClientId::new(0).is_some());
        assert!(ClientId::new(MAX_CLIENTS - 1).is_some());
        assert!(ClientId::new(MAX_CLIENTS).is_none());
        assert_eq!(ClientId::new(7).map(ClientId::entity), Some(7));
    }

    #[test]
    fn test_memory_enemy_capacity_evicts_stalest() {
        let mut memory = BotMemory::default();
        for i in 0..ENEMY_MEMORY_CAPACITY + 1 {
            memory.record_enemy(i, Vec3::ZERO, i as f32);
        }
        assert!(memory.enemy(0).is_none());
        assert!(memory.enemy(ENEMY_MEMORY_CAPACITY).is_some());
        assert_eq!(memory.latest_enemy().map(|(id, _)| id), Some(ENEMY_MEMORY_CAPACITY));
    }

    #[test]
    fn test_memory_visits_and_damage() {
        let mut memory = BotMemory::default();
        assert!(memory.record_visit(Vec3::ZERO));
        assert!(!memory.record_visit(Vec3::new(10.0, 0.0, 0.0)));
        assert!(memory.record_visit(Vec3::new(200.0, 0.0, 0.0)));
        memory.record_damage(Some(3), 20, 1.0);
        memory.record_damage(None, 5, 2.0);
        assert_eq!(memory.damage_since(1.5), 5);
        assert_eq!(memory.last_attacker(), Some(3));

        let bounds = (Vec3::new(-900.0, -900.0, 0.0), Vec3::new(900.0, 900.0, 0.0));
        let target = memory.exploration_target(bounds, Vec3::ZERO);
        assert!(target.flat().distance_to(Vec3::ZERO) > 300.0);
    }

    #[test]
    fn test_goal_priority_accessors() {
        assert_eq!(CurrentGoal::None.position(), None);
        let goal = CurrentGoal::Item {
            entity: 3,
            position: Vec3::ONE,
            priority: 0.4,
        };
        assert_eq!(goal.position(), Some(Vec3::ONE));
        assert!((goal.priority() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_item_need() {
        let inventory = Inventory::spawn_loadout();
        let hurt = SelfState {
            health: 30,
            ..Default::default()
        };
        let fine = SelfState {
            health: 100,
            ..Default::default()
        };
        assert!(item_need(EntityKind::Health, &hurt, &inventory) > item_need(EntityKind::Health, &fine, &inventory));
        assert_eq!(item_need(EntityKind::Health, &fine, &inventory), 0.0);
        assert!(item_need(EntityKind::WeaponPickup(Weapon::Railgun), &fine, &inventory) > 0.5);
    }

    // ========================================================================
    // Think pipeline
    // ========================================================================

    #[test]
    fn test_spawn_settles_then_engages() {
        let mut world = duel();
        let cover = CoverManager::new();
        let mut b = bot(0, Personality::Balanced);
        let outcomes = run(&mut b, &mut world, &cover, 30);

        // The first think leaves Spawning only after the settle time
        assert_eq!(outcomes[0].transition, None);
        assert_eq!(b.state(), BotState::Combat);
        assert!(outcomes.iter().any(|o| !o.sightings.is_empty()));
        assert_eq!(b.combat().target().map(|t| t.id), Some(1));

        // Facing the target (+x) within tolerance and firing
        let last = b.last_cmd();
        assert!(wrap_degrees(last.angles.y).abs() < FIRE_ANGLE_TOLERANCE * 2.0);
        assert!(outcomes.iter().any(|o| o.cmd.buttons.contains(Buttons::ATTACK)));
    }

    #[test]
    fn test_turn_rate_is_limited() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        world.insert_at(0, standing_player(0, 0.0, 0.0, Team::Red));
        // Bot faces +y, enemy off to the side
        world.insert_at(1, standing_player(1, 400.0, 0.0, Team::Blue));
        if let Some(e) = world.entity_mut(0) {
            e.angles = Vec3::new(0.0, 90.0, 0.0);
        }
        let cover = CoverManager::new();
        let mut b = bot(0, Personality::Balanced);
        b.state = BotState::Idle;
        world.advance(1.0);
        let now = world.time();
        b.last_think = Some(now - DEFAULT_THINK_TIME);
        let out = b.think(&world, &cover, now);
        let max_step = MAX_TURN_RATE * DEFAULT_THINK_TIME + 1e-3;
        assert!(wrap_degrees(out.cmd.angles.y - 90.0).abs() <= max_step);
    }

    #[test]
    fn test_dead_bot_emits_empty_command() {
        let mut world = duel();
        if let Some(e) = world.entity_mut(0) {
            e.health = 0;
        }
        let cover = CoverManager::new();
        let mut b = bot(0, Personality::Aggressive);
        world.advance(1.0);
        let now = world.time();
        let out = b.think(&world, &cover, now);
        assert_eq!(b.state(), BotState::Dead);
        assert_eq!(out.transition, Some((BotState::Spawning, BotState::Dead)));
        assert_eq!(out.cmd.forward_move, 0);
        assert!(out.cmd.buttons.is_empty());

        // Respawn goes back through Spawning
        if let Some(e) = world.entity_mut(0) {
            e.health = 100;
        }
        world.advance(1.0);
        let now = world.time();
        b.think(&world, &cover, now);
        assert_eq!(b.state(), BotState::Spawning);
    }

    #[test]
    fn test_think_gating() {
        let mut b = bot(0, Personality::Balanced);
        assert!(b.is_due(0.0));
        let world = duel();
        let cover = CoverManager::new();
        b.think(&world, &cover, 1.0);
        assert!(!b.is_due(1.0 + DEFAULT_THINK_TIME * 0.5));
        assert!(b.is_due(1.0 + DEFAULT_THINK_TIME));
    }

    #[test]
    fn test_button_goal_pressed_in_range() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        world.insert_at(0, standing_player(0, 0.0, 0.0, Team::Red));
        let cover = CoverManager::new();
        let mut b = bot(0, Personality::Support);
        b.state = BotState::Idle;
        b.set_goal(CurrentGoal::Button {
            position: Vec3::new(20.0, 0.0, 24.0),
            priority: 5.0,
        });
        world.advance(1.0);
        let now = world.time();
        let out = b.think(&world, &cover, now);
        assert!(out.cmd.buttons.contains(Buttons::USE));
        assert_eq!(b.current_goal(), CurrentGoal::None);
    }

    #[test]
    fn test_learning_bot_records_steps() {
        let mut world = duel();
        let cover = CoverManager::new();
        let settings = BotSettings {
            learning: true,
            ..Default::default()
        };
        let mut b = BotController::new(
            ClientId::new(0).expect("slot"),
            CharacterProfile::builtin("Learner", 0.5),
            Team::Red,
            settings,
            9,
        )
        .expect("controller");
        run(&mut b, &mut world, &cover, 30);
        let agent = b.ppo().expect("agent");
        assert!(agent.steps() > 0);
    }
}
