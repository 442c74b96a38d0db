//! Team coordination: squads, formations, messages and coordinated tactics
//!
//! One [`TeamCoordinator`] per team. It keeps member snapshots, groups
//! members into squads, owns the team's [`StrategicPlanner`], and turns the
//! current plan into per-member [`Order`]s at most every
//! `COORDINATION_INTERVAL` seconds.

use std::collections::BTreeMap;
use std::f32::consts::{PI, TAU};

use rand::Rng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ai::constants::bot::VISITED_SPACING;
use crate::ai::constants::combat::LOW_HEALTH;
use crate::ai::constants::perception::MEMORY_MAX_AGE;
use crate::ai::constants::strategy::OBJECTIVE_RADIUS;
use crate::ai::constants::team::{
    COORDINATION_INTERVAL, COVER_BEHIND_OFFSET, CROSSFIRE_RADIUS, FLANK_DISTANCE, FORMATION_SPACING,
    HIGH_EFFECTIVENESS, LOW_EFFECTIVENESS, MAX_ATTACKERS, MAX_SQUADS, MAX_SQUAD_SIZE, MESSAGES_PER_UPDATE,
    MESSAGE_QUEUE_CAPACITY, SUPPRESSION_OFFSET, VELOCITY_MATCH_WEIGHT,
};
use crate::ai::neural::NetworkError;
use crate::ai::strategy::{GoalKind, StrategicPlanner, TeamSnapshot, UnitSnapshot};
use crate::ai::weapons::Weapon;
use crate::util::ring::RingBuffer;
use crate::util::vec3::Vec3;
use crate::world::{EntityId, EntityKind, Team, World};

#[derive(Error, Debug)]
pub enum TeamError {
    #[error("Team full: {squads} squads of {size}")]
    TeamFull { squads: usize, size: usize },

    #[error("Unknown squad: {0}")]
    UnknownSquad(usize),

    #[error("Unknown member: {0}")]
    UnknownMember(EntityId),

    #[error("Strategy network error: {0}")]
    Network(#[from] NetworkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Formation {
    None,
    Line,
    Column,
    #[default]
    Wedge,
    Diamond,
    Circle,
    Spread,
}

impl Formation {
    /// Offset of slot `index` out of `count` in the squad frame: x along
    /// the heading, y to its left
    pub fn offset(self, index: usize, count: usize, spacing: f32) -> Vec3 {
        let i = index as f32;
        let centered = i - (count.max(1) - 1) as f32 * 0.5;
        match self {
            Formation::None => Vec3::ZERO,
            Formation::Line => Vec3::new(0.0, -centered * spacing, 0.0),
            Formation::Column => Vec3::new(-i * spacing, 0.0, 0.0),
            Formation::Wedge => {
                if index == 0 {
                    return Vec3::ZERO;
                }
                let row = index.div_ceil(2) as f32;
                let side = if index % 2 == 1 { 1.0 } else { -1.0 };
                Vec3::new(-row * spacing, side * row * spacing, 0.0)
            }
            Formation::Diamond => match index {
                0 => Vec3::new(spacing, 0.0, 0.0),
                1 => Vec3::new(0.0, spacing, 0.0),
                2 => Vec3::new(0.0, -spacing, 0.0),
                3 => Vec3::new(-spacing, 0.0, 0.0),
                _ => Vec3::ZERO,
            },
            Formation::Circle => {
                if count <= 1 {
                    return Vec3::ZERO;
                }
                let angle = TAU * i / count as f32;
                Vec3::new(angle.cos() * spacing, angle.sin() * spacing, 0.0)
            }
            Formation::Spread => {
                let stagger = if index % 2 == 1 { -spacing } else { 0.0 };
                Vec3::new(stagger, -centered * spacing * 2.0, 0.0)
            }
        }
    }

    /// World position of a slot around `anchor` facing `heading`
    pub fn slot(self, anchor: Vec3, heading: Vec3, index: usize, count: usize, spacing: f32) -> Vec3 {
        let forward = {
            let f = heading.flat().normalize();
            if f.is_zero(1e-6) {
                Vec3::FORWARD
            } else {
                f
            }
        };
        let left = forward.perpendicular_xy();
        let o = self.offset(index, count, spacing);
        anchor + forward * o.x + left * o.y
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    #[default]
    Assault,
    Support,
    Heavy,
    Sniper,
    Scout,
}

impl Role {
    /// Members that lay down suppressing fire when defending
    pub fn suppresses(self) -> bool {
        matches!(self, Role::Support | Role::Heavy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SquadState {
    #[default]
    Idle,
    Moving,
    Engaging,
    Defending,
    Flanking,
    Retreating,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: EntityId,
    pub role: Role,
    pub squad: Option<usize>,
    pub position: Vec3,
    pub velocity: Vec3,
    pub health: i32,
    pub armor: i32,
    /// Current weapon ammo, 0..1
    pub ammo: f32,
    pub weapon: Weapon,
    pub alive: bool,
    pub last_update: f32,
}

impl TeamMember {
    fn new(id: EntityId, role: Role) -> Self {
        Self {
            id,
            role,
            squad: None,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            health: 100,
            armor: 0,
            ammo: 1.0,
            weapon: Weapon::Machinegun,
            alive: true,
            last_update: 0.0,
        }
    }

    /// (health + 0.5 armor + ammo) / 2.5, all normalized
    pub fn effectiveness(&self) -> f32 {
        let health = (self.health.max(0) as f32 / 100.0).min(1.0);
        let armor = (self.armor.max(0) as f32 / 100.0).min(1.0);
        ((health + 0.5 * armor + self.ammo.clamp(0.0, 1.0)) / 2.5).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Squad {
    pub id: usize,
    pub members: SmallVec<[EntityId; MAX_SQUAD_SIZE]>,
    pub leader: Option<EntityId>,
    pub formation: Formation,
    pub state: SquadState,
    pub objective: Option<u32>,
    pub destination: Option<Vec3>,
    pub target: Option<EntityId>,
    /// Time of the last direct order; plan assignments older than this are ignored
    pub commanded_at: Option<f32>,
}

impl Squad {
    fn new(id: usize) -> Self {
        Self {
            id,
            members: SmallVec::new(),
            leader: None,
            formation: Formation::default(),
            state: SquadState::Idle,
            objective: None,
            destination: None,
            target: None,
            commanded_at: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= MAX_SQUAD_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Where a member should be and what it should do there
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Order {
    MoveTo { position: Vec3 },
    Attack { target: EntityId, position: Vec3 },
    Hold { position: Vec3 },
    Suppress { position: Vec3, toward: Vec3 },
    Cover { position: Vec3 },
    Flank { target: EntityId, position: Vec3 },
    Retreat { position: Vec3 },
}

impl Order {
    pub fn position(&self) -> Vec3 {
        match *self {
            Order::MoveTo { position }
            | Order::Attack { position, .. }
            | Order::Hold { position }
            | Order::Suppress { position, .. }
            | Order::Cover { position }
            | Order::Flank { position, .. }
            | Order::Retreat { position } => position,
        }
    }

    pub fn target(&self) -> Option<EntityId> {
        match *self {
            Order::Attack { target, .. } | Order::Flank { target, .. } => Some(target),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Backup,
    CoverFire,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AlertKind {
    EnemySpotted { enemy: EntityId, position: Vec3, weapon: Weapon },
    MemberDown { member: EntityId },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TeamMessage {
    /// Redirect a squad
    Command { from: EntityId, squad: usize, destination: Vec3 },
    /// Member self-report between coordination passes
    Status { from: EntityId, health: i32, armor: i32, position: Vec3 },
    Request { from: EntityId, kind: RequestKind, position: Vec3 },
    Alert { from: EntityId, alert: AlertKind },
}

/// An enemy known to the team
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub position: Vec3,
    pub weapon: Weapon,
    pub last_seen: f32,
    pub reporter: EntityId,
}

/// Crossfire arc around `target`, centered on the approach direction
pub fn crossfire_positions(target: Vec3, approach_from: Vec3, count: usize) -> SmallVec<[Vec3; MAX_ATTACKERS]> {
    let count = count.min(MAX_ATTACKERS);
    let away = approach_from - target;
    let base = away.y.atan2(away.x);
    (0..count)
        .map(|k| {
            let angle = base + (k as f32 - (count - 1) as f32 * 0.5) * (PI / 4.0);
            target + Vec3::new(angle.cos(), angle.sin(), 0.0) * CROSSFIRE_RADIUS
        })
        .collect()
}

/// Spot behind `ally` as seen from `threat`
pub fn cover_behind(ally: Vec3, threat: Vec3) -> Vec3 {
    ally + (ally - threat).flat().normalize() * COVER_BEHIND_OFFSET
}

/// Left and right flank points around `target` for a squad at `from`
pub fn flank_positions(from: Vec3, target: Vec3) -> (Vec3, Vec3) {
    let dir = (target - from).flat().normalize();
    let left = dir.perpendicular_xy();
    (target + left * FLANK_DISTANCE, target - left * FLANK_DISTANCE)
}

/// Suppression spots fanned sideways across the line from `point` toward the threat
fn suppression_positions(point: Vec3, threat: Vec3, count: usize) -> Vec<Vec3> {
    let dir = (threat - point).flat().normalize();
    let side = dir.perpendicular_xy();
    (0..count)
        .map(|k| {
            let lateral = (k as f32 - (count.max(1) - 1) as f32 * 0.5) * SUPPRESSION_OFFSET;
            point + side * lateral
        })
        .collect()
}

/// Per-team coordination state
#[derive(Debug, Clone)]
pub struct TeamCoordinator {
    team: Team,
    members: BTreeMap<EntityId, TeamMember>,
    squads: Vec<Squad>,
    messages: RingBuffer<TeamMessage>,
    contacts: BTreeMap<EntityId, Contact>,
    orders: BTreeMap<EntityId, Order>,
    planner: StrategicPlanner,
    home: Option<Vec3>,
    last_update: Option<f32>,
    team_score: i32,
    enemy_score: i32,
    time_remaining: f32,
    effectiveness: f32,
    coordination_quality: f32,
    risk_tolerance: f32,
    coordinated_attacks: bool,
    messages_dropped: u64,
    replans: u64,
}

impl TeamCoordinator {
    pub fn new<R: Rng + ?Sized>(team: Team, rng: &mut R) -> Result<Self, TeamError> {
        Ok(Self {
            team,
            members: BTreeMap::new(),
            squads: Vec::new(),
            messages: RingBuffer::new(MESSAGE_QUEUE_CAPACITY),
            contacts: BTreeMap::new(),
            orders: BTreeMap::new(),
            planner: StrategicPlanner::new(rng)?,
            home: None,
            last_update: None,
            team_score: 0,
            enemy_score: 0,
            time_remaining: f32::INFINITY,
            effectiveness: 1.0,
            coordination_quality: 0.0,
            risk_tolerance: 0.5,
            coordinated_attacks: true,
            messages_dropped: 0,
            replans: 0,
        })
    }

    pub fn team(&self) -> Team {
        self.team
    }

    pub fn member(&self, id: EntityId) -> Option<&TeamMember> {
        self.members.get(&id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn squads(&self) -> &[Squad] {
        &self.squads
    }

    pub fn squad(&self, id: usize) -> Result<&Squad, TeamError> {
        self.squads.get(id).ok_or(TeamError::UnknownSquad(id))
    }

    pub fn squad_mut(&mut self, id: usize) -> Result<&mut Squad, TeamError> {
        self.squads.get_mut(id).ok_or(TeamError::UnknownSquad(id))
    }

    pub fn order_for(&self, id: EntityId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn contacts(&self) -> impl Iterator<Item = (&EntityId, &Contact)> {
        self.contacts.iter()
    }

    pub fn planner(&self) -> &StrategicPlanner {
        &self.planner
    }

    pub fn planner_mut(&mut self) -> &mut StrategicPlanner {
        &mut self.planner
    }

    pub fn effectiveness(&self) -> f32 {
        self.effectiveness
    }

    pub fn coordination_quality(&self) -> f32 {
        self.coordination_quality
    }

    pub fn risk_tolerance(&self) -> f32 {
        self.risk_tolerance
    }

    pub fn coordinated_attacks(&self) -> bool {
        self.coordinated_attacks
    }

    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped
    }

    pub fn pending_messages(&self) -> usize {
        self.messages.len()
    }

    pub fn replans(&self) -> u64 {
        self.replans
    }

    pub fn set_match_info(&mut self, team_score: i32, enemy_score: i32, time_remaining: f32) {
        self.team_score = team_score;
        self.enemy_score = enemy_score;
        self.time_remaining = time_remaining;
    }

    /// Add a member to the first squad with room, opening a new squad when
    /// all are full. Returns the squad id.
    pub fn add_member(&mut self, id: EntityId, role: Role) -> Result<usize, TeamError> {
        if let Some(squad) = self.members.get(&id).and_then(|m| m.squad) {
            return Ok(squad);
        }
        let squad_id = match self.squads.iter().position(|s| !s.is_full()) {
            Some(i) => i,
            None if self.squads.len() < MAX_SQUADS => {
                self.squads.push(Squad::new(self.squads.len()));
                self.squads.len() - 1
            }
            None => {
                return Err(TeamError::TeamFull {
                    squads: MAX_SQUADS,
                    size: MAX_SQUAD_SIZE,
                })
            }
        };
        let squad = &mut self.squads[squad_id];
        squad.members.push(id);
        squad.leader.get_or_insert(id);
        let mut member = TeamMember::new(id, role);
        member.squad = Some(squad_id);
        self.members.insert(id, member);
        debug!(team = ?self.team, member = id, squad = squad_id, ?role, "Member joined squad");
        Ok(squad_id)
    }

    pub fn remove_member(&mut self, id: EntityId) -> Result<(), TeamError> {
        let member = self.members.remove(&id).ok_or(TeamError::UnknownMember(id))?;
        self.orders.remove(&id);
        if let Some(squad) = member.squad.and_then(|s| self.squads.get_mut(s)) {
            squad.members.retain(|m| *m != id);
            if squad.leader == Some(id) {
                squad.leader = squad.members.first().copied();
            }
            if squad.is_empty() {
                squad.state = SquadState::Idle;
                squad.objective = None;
            }
        }
        Ok(())
    }

    /// Queue a message; a full queue drops its oldest entry
    pub fn post(&mut self, message: TeamMessage) {
        if self.messages.push(message).is_some() {
            self.messages_dropped += 1;
            debug!(team = ?self.team, "Team message queue full, oldest dropped");
        }
    }

    /// Record a sighting directly, bypassing the queue
    pub fn report_contact(&mut self, enemy: EntityId, position: Vec3, weapon: Weapon, reporter: EntityId, now: f32) {
        self.contacts.insert(
            enemy,
            Contact {
                position,
                weapon,
                last_seen: now,
                reporter,
            },
        );
    }

    /// Run one coordination pass when the interval has elapsed. Returns
    /// whether a pass ran.
    pub fn coordinate<W: World + ?Sized>(&mut self, world: &W, now: f32) -> bool {
        if let Some(last) = self.last_update {
            if now - last < COORDINATION_INTERVAL {
                return false;
            }
        }
        self.last_update = Some(now);

        self.refresh_members(world, now);
        self.process_messages(now);

        let snapshot = self.snapshot(world);
        self.planner.observe(&snapshot);
        self.planner.update_objectives(&snapshot, now);
        if self.planner.needs_replanning(now) {
            match self.planner.create_plan(&snapshot, now) {
                Ok(plan) => {
                    self.replans += 1;
                    debug!(team = ?self.team, strategy = ?plan.strategy, "Team replanned");
                }
                Err(e) => warn!(team = ?self.team, error = %e, "Strategic planning failed"),
            }
        }

        self.distribute_objectives();
        self.execute_tactics(now);
        self.evaluate_performance();
        true
    }

    fn refresh_members<W: World + ?Sized>(&mut self, world: &W, now: f32) {
        for member in self.members.values_mut() {
            match world.entity(member.id) {
                Some(e) if e.is_alive_player() => {
                    member.position = e.position;
                    member.velocity = e.velocity;
                    member.health = e.health;
                    member.armor = e.armor;
                    member.weapon = e.weapon;
                    member.ammo = if e.weapon == Weapon::Gauntlet {
                        1.0
                    } else {
                        (e.inventory.ammo(e.weapon) as f32 / 100.0).clamp(0.0, 1.0)
                    };
                    member.alive = true;
                }
                _ => member.alive = false,
            }
            member.last_update = now;
        }
        if self.home.is_none() {
            self.home = self.alive_centroid(self.members.keys().copied());
        }
        self.contacts.retain(|id, c| {
            now - c.last_seen <= MEMORY_MAX_AGE && world.entity(*id).is_some_and(|e| e.is_alive_player())
        });
    }

    /// Drain at most `MESSAGES_PER_UPDATE` messages, oldest first
    pub fn process_messages(&mut self, now: f32) -> usize {
        let mut handled = 0;
        while handled < MESSAGES_PER_UPDATE {
            let Some(message) = self.messages.pop_oldest() else {
                break;
            };
            handled += 1;
            match message {
                TeamMessage::Command { from, squad, destination } => match self.squad_mut(squad) {
                    Ok(s) => {
                        s.destination = Some(destination);
                        s.state = SquadState::Moving;
                        s.commanded_at = Some(now);
                        debug!(from, squad, "Squad redirected");
                    }
                    Err(e) => warn!(from, error = %e, "Command ignored"),
                },
                TeamMessage::Status { from, health, armor, position } => {
                    if let Some(m) = self.members.get_mut(&from) {
                        m.health = health;
                        m.armor = armor;
                        m.position = position;
                        m.alive = health > 0;
                    }
                }
                TeamMessage::Request { from, kind, position } => self.handle_request(from, kind, position, now),
                TeamMessage::Alert { from, alert } => match alert {
                    AlertKind::EnemySpotted { enemy, position, weapon } => {
                        self.report_contact(enemy, position, weapon, from, now);
                    }
                    AlertKind::MemberDown { member } => {
                        if let Some(m) = self.members.get_mut(&member) {
                            m.alive = false;
                        }
                        self.orders.remove(&member);
                    }
                },
            }
        }
        handled
    }

    fn handle_request(&mut self, from: EntityId, kind: RequestKind, position: Vec3, now: f32) {
        let own_squad = self.members.get(&from).and_then(|m| m.squad);
        match kind {
            RequestKind::Backup => {
                // Nearest other squad that is not already fighting
                let helper = self
                    .squads
                    .iter()
                    .filter(|s| Some(s.id) != own_squad && !s.is_empty())
                    .filter(|s| !matches!(s.state, SquadState::Engaging | SquadState::Flanking))
                    .filter_map(|s| {
                        let c = self.alive_centroid(s.members.iter().copied())?;
                        Some((s.id, c.distance_sq_to(position)))
                    })
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(id, _)| id);
                if let Some(squad) = helper.and_then(|id| self.squads.get_mut(id)) {
                    squad.state = SquadState::Moving;
                    squad.destination = Some(position);
                    squad.commanded_at = Some(now);
                    debug!(from, squad = squad.id, "Backup dispatched");
                }
            }
            RequestKind::CoverFire => {
                // Hold around the requester and suppress whatever it is facing
                let anchor = self.members.get(&from).map(|m| m.position);
                let target = self.nearest_contact(position).map(|(id, _)| id);
                if let (Some(anchor), Some(squad)) = (anchor, own_squad.and_then(|id| self.squads.get_mut(id))) {
                    squad.state = SquadState::Defending;
                    squad.destination = Some(anchor);
                    squad.target = target;
                    squad.commanded_at = Some(now);
                }
            }
        }
    }

    fn alive_centroid(&self, ids: impl Iterator<Item = EntityId>) -> Option<Vec3> {
        let (sum, n) = ids
            .filter_map(|id| self.members.get(&id))
            .filter(|m| m.alive)
            .fold((Vec3::ZERO, 0usize), |(s, n), m| (s + m.position, n + 1));
        (n > 0).then(|| sum * (1.0 / n as f32))
    }

    /// Planner input from the current member and contact picture
    pub fn snapshot<W: World + ?Sized>(&self, world: &W) -> TeamSnapshot {
        let members = self
            .members
            .values()
            .map(|m| UnitSnapshot {
                id: m.id,
                position: m.position,
                health: m.health,
                armor: m.armor,
                weapon_tier: m.weapon.tier(),
                alive: m.alive,
            })
            .collect();
        let enemies = self
            .contacts
            .iter()
            .map(|(id, c)| UnitSnapshot {
                id: *id,
                position: c.position,
                health: 100,
                armor: 0,
                weapon_tier: c.weapon.tier(),
                alive: true,
            })
            .collect();
        let high_value = world
            .entities()
            .iter()
            .filter(|e| e.in_use)
            .filter(|e| match e.kind {
                EntityKind::Powerup => true,
                EntityKind::WeaponPickup(w) => w.tier() >= 0.5,
                _ => false,
            })
            .map(|e| e.position)
            .collect();
        TeamSnapshot {
            members,
            enemies,
            team_score: self.team_score,
            enemy_score: self.enemy_score,
            time_remaining: self.time_remaining,
            bounds: world.bounds(),
            high_value,
            defend_point: self.home,
        }
    }

    /// Hand open objectives to non-empty squads round-robin in plan order
    fn distribute_objectives(&mut self) {
        let Some(plan) = self.planner.plan_mut() else {
            return;
        };
        let open: Vec<usize> = plan
            .objectives
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_open())
            .map(|(i, _)| i)
            .collect();
        if open.is_empty() {
            return;
        }
        for goal in plan.goals.iter_mut() {
            goal.assigned.clear();
        }
        let active: Vec<usize> = self.squads.iter().filter(|s| !s.is_empty()).map(|s| s.id).collect();
        for (slot, squad_id) in active.into_iter().enumerate() {
            let obj = &mut plan.objectives[open[slot % open.len()]];
            obj.assigned_squad = Some(squad_id);
            let Some(goal) = plan.goals.get_mut(obj.goal) else {
                continue;
            };
            let squad = &mut self.squads[squad_id];
            // Direct orders stand until a newer plan replaces them
            if squad.commanded_at.is_some_and(|t| t >= plan.created_at) {
                continue;
            }
            squad.commanded_at = None;
            goal.assigned.extend(squad.members.iter().copied());
            squad.objective = Some(obj.id);
            squad.destination = Some(obj.position);
            let (state, target) = match goal.kind {
                GoalKind::Eliminate { target } => (SquadState::Engaging, target),
                GoalKind::Defend { .. } | GoalKind::Survive => (SquadState::Defending, None),
                GoalKind::Capture { .. }
                | GoalKind::Collect
                | GoalKind::Control
                | GoalKind::Dominate
                | GoalKind::Support { .. } => (SquadState::Moving, None),
            };
            squad.state = state;
            squad.target = target;
        }
    }

    fn nearest_contact(&self, to: Vec3) -> Option<(EntityId, Vec3)> {
        self.contacts
            .iter()
            .min_by(|a, b| a.1.position.distance_sq_to(to).total_cmp(&b.1.position.distance_sq_to(to)))
            .map(|(id, c)| (*id, c.position))
    }

    fn team_velocity(&self) -> Vec3 {
        let (sum, n) = self
            .members
            .values()
            .filter(|m| m.alive)
            .fold((Vec3::ZERO, 0usize), |(s, n), m| (s + m.velocity, n + 1));
        if n == 0 {
            Vec3::ZERO
        } else {
            sum * (1.0 / n as f32)
        }
    }

    fn execute_tactics(&mut self, now: f32) {
        self.orders.clear();
        let team_velocity = self.team_velocity();
        let home = self.home;

        for index in 0..self.squads.len() {
            let members: SmallVec<[EntityId; MAX_SQUAD_SIZE]> = self.squads[index]
                .members
                .iter()
                .copied()
                .filter(|id| self.members.get(id).is_some_and(|m| m.alive))
                .collect();
            let Some(center) = self.alive_centroid(members.iter().copied()) else {
                continue;
            };

            let health = members
                .iter()
                .filter_map(|id| self.members.get(id))
                .map(|m| m.health)
                .sum::<i32>()
                / members.len().max(1) as i32;

            // Resolve the squad's target from the shared contact picture
            let squad = &self.squads[index];
            let destination = squad.destination.unwrap_or(center);
            let target = squad
                .target
                .and_then(|id| self.contacts.get(&id).map(|c| (id, c.position)))
                .or_else(|| self.nearest_contact(destination));

            let mut state = squad.state;
            if health <= LOW_HEALTH && state != SquadState::Idle {
                state = SquadState::Retreating;
            } else if matches!(state, SquadState::Engaging | SquadState::Flanking) {
                state = match target {
                    None => SquadState::Moving,
                    Some(_) if !self.coordinated_attacks => SquadState::Defending,
                    Some(_) if self.effectiveness > HIGH_EFFECTIVENESS && members.len() >= 2 => SquadState::Flanking,
                    Some(_) => SquadState::Engaging,
                };
            }

            let mut orders: SmallVec<[(EntityId, Order); MAX_SQUAD_SIZE]> = SmallVec::new();
            match (state, target) {
                (SquadState::Idle, _) => {
                    orders.extend(
                        members
                            .iter()
                            .filter_map(|id| self.members.get(id))
                            .map(|m| (m.id, Order::Hold { position: m.position })),
                    );
                }
                (SquadState::Retreating, _) => {
                    let position = home.unwrap_or(center);
                    orders.extend(members.iter().map(|id| (*id, Order::Retreat { position })));
                }
                (SquadState::Engaging, Some((target_id, target_pos))) => {
                    let mut by_distance: SmallVec<[(EntityId, f32); MAX_SQUAD_SIZE]> = members
                        .iter()
                        .filter_map(|id| self.members.get(id))
                        .map(|m| (m.id, m.position.distance_sq_to(target_pos)))
                        .collect();
                    by_distance.sort_by(|a, b| a.1.total_cmp(&b.1));
                    let spots = crossfire_positions(target_pos, center, by_distance.len());
                    for (k, (id, _)) in by_distance.iter().enumerate() {
                        let order = match spots.get(k) {
                            Some(position) => Order::Attack {
                                target: target_id,
                                position: *position,
                            },
                            None => Order::Cover {
                                position: cover_behind(spots.first().copied().unwrap_or(center), target_pos),
                            },
                        };
                        orders.push((*id, order));
                    }
                }
                (SquadState::Flanking, Some((target_id, target_pos))) => {
                    let (left, right) = flank_positions(center, target_pos);
                    let half = members.len().div_ceil(2);
                    for (k, id) in members.iter().enumerate() {
                        let position = if k < half { left } else { right };
                        orders.push((*id, Order::Flank { target: target_id, position }));
                    }
                }
                (SquadState::Defending, _) => {
                    let threat = target.map_or_else(|| destination + (destination - center), |(_, p)| p);
                    let (suppressors, others): (SmallVec<[EntityId; MAX_SQUAD_SIZE]>, SmallVec<[EntityId; MAX_SQUAD_SIZE]>) =
                        members
                            .iter()
                            .copied()
                            .partition(|id| self.members.get(id).is_some_and(|m| m.role.suppresses()));
                    let (suppressors, others) = if suppressors.is_empty() {
                        (members[..1].iter().copied().collect(), members[1..].iter().copied().collect())
                    } else {
                        (suppressors, others)
                    };
                    let spots = suppression_positions(destination, threat, suppressors.len());
                    for (id, position) in suppressors.iter().zip(spots.iter()) {
                        orders.push((*id, Order::Suppress { position: *position, toward: threat }));
                    }
                    let anchor = spots.first().copied().unwrap_or(destination);
                    let behind = cover_behind(anchor, threat);
                    orders.extend(others.iter().map(|id| (*id, Order::Cover { position: behind })));
                }
                // Moving, or a fight with nobody to fight
                (_, _) => {
                    let to_goal = destination - center;
                    let anchor = if to_goal.length_xy() <= OBJECTIVE_RADIUS {
                        destination
                    } else {
                        center + to_goal.clamp_length(FORMATION_SPACING * 2.0)
                    };
                    let anchor = anchor + team_velocity * VELOCITY_MATCH_WEIGHT;
                    let formation = squad.formation;
                    for (k, id) in members.iter().enumerate() {
                        let position = formation.slot(anchor, to_goal, k, members.len(), FORMATION_SPACING);
                        orders.push((*id, Order::MoveTo { position }));
                    }
                    if state != SquadState::Moving {
                        state = SquadState::Moving;
                    }
                }
            }

            let squad = &mut self.squads[index];
            if squad.state != state {
                debug!(squad = squad.id, from = ?squad.state, to = ?state, time = now, "Squad state changed");
                squad.state = state;
            }
            squad.target = target.map(|(id, _)| id);
            self.orders.extend(orders);
        }
    }

    /// Recompute team effectiveness and the tactic bias derived from it
    fn evaluate_performance(&mut self) {
        let alive: Vec<&TeamMember> = self.members.values().filter(|m| m.alive).collect();
        self.effectiveness = if alive.is_empty() {
            0.0
        } else {
            alive.iter().map(|m| m.effectiveness()).sum::<f32>() / alive.len() as f32
        };

        let placed = alive
            .iter()
            .filter(|m| {
                self.orders
                    .get(&m.id)
                    .is_some_and(|o| o.position().distance_to(m.position) <= VISITED_SPACING * 2.0)
            })
            .count();
        self.coordination_quality = if alive.is_empty() { 0.0 } else { placed as f32 / alive.len() as f32 };

        let planned = self.planner.plan().map_or(0.5, |p| p.weights.risk_tolerance);
        let was = self.coordinated_attacks;
        if self.effectiveness < LOW_EFFECTIVENESS {
            self.coordinated_attacks = false;
            self.risk_tolerance = planned.min(0.2);
        } else if self.effectiveness > HIGH_EFFECTIVENESS {
            self.coordinated_attacks = true;
            self.risk_tolerance = planned.max(0.8);
        } else {
            self.coordinated_attacks = true;
            self.risk_tolerance = planned;
        }
        if was != self.coordinated_attacks {
            info!(
                team = ?self.team,
                effectiveness = self.effectiveness,
                coordinated = self.coordinated_attacks,
                "Team tactic bias changed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::brush::{standing_player, BrushWorld};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn coordinator() -> TeamCoordinator {
        TeamCoordinator::new(Team::Red, &mut StdRng::seed_from_u64(5)).expect("coordinator")
    }

    fn arena(players: &[(EntityId, f32, f32, Team)]) -> BrushWorld {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        for (id, x, y, team) in players {
            world.insert_at(*id, standing_player(*id, *x, *y, *team));
        }
        world
    }

    // ========================================================================
    // Formations
    // ========================================================================

    #[test]
    fn test_formation_offsets() {
        assert_eq!(Formation::None.offset(3, 5, 96.0), Vec3::ZERO);
        assert_eq!(Formation::Wedge.offset(0, 5, 96.0), Vec3::ZERO);
        let left = Formation::Wedge.offset(1, 5, 96.0);
        let right = Formation::Wedge.offset(2, 5, 96.0);
        assert!(left.x < 0.0 && left.y > 0.0);
        assert!((left.y + right.y).abs() < 1e-4);

        // Line is centered on the anchor
        let sum = (0..4).fold(Vec3::ZERO, |a, i| a + Formation::Line.offset(i, 4, 96.0));
        assert!(sum.approx_eq(Vec3::ZERO, 1e-3));

        for i in 0..5 {
            let o = Formation::Circle.offset(i, 5, 96.0);
            assert!((o.length() - 96.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_formation_slot_follows_heading() {
        // Column behind the anchor when heading +y
        let slot = Formation::Column.slot(Vec3::ZERO, Vec3::LEFT, 2, 3, 100.0);
        assert!(slot.approx_eq(Vec3::new(0.0, -200.0, 0.0), 1e-3));
    }

    // ========================================================================
    // Squads
    // ========================================================================

    #[test]
    fn test_squad_assignment_caps() {
        let mut team = coordinator();
        for id in 0..MAX_SQUADS * MAX_SQUAD_SIZE {
            let squad = team.add_member(id, Role::Assault).expect("room");
            assert_eq!(squad, id / MAX_SQUAD_SIZE);
        }
        let overflow = team.add_member(999, Role::Assault);
        assert!(matches!(overflow, Err(TeamError::TeamFull { .. })));
        assert_eq!(team.squads().len(), MAX_SQUADS);
    }

    #[test]
    fn test_remove_member_passes_leadership() {
        let mut team = coordinator();
        team.add_member(1, Role::Assault).expect("add");
        team.add_member(2, Role::Support).expect("add");
        assert_eq!(team.squads()[0].leader, Some(1));
        team.remove_member(1).expect("remove");
        assert_eq!(team.squads()[0].leader, Some(2));
        assert!(matches!(team.remove_member(1), Err(TeamError::UnknownMember(1))));
        assert!(team.squad(7).is_err());
    }

    // ========================================================================
    // Messages
    // ========================================================================

    #[test]
    fn test_message_queue_drops_oldest() {
        let mut team = coordinator();
        for i in 0..MESSAGE_QUEUE_CAPACITY + 3 {
            team.post(TeamMessage::Status {
                from: i,
                health: 100,
                armor: 0,
                position: Vec3::ZERO,
            });
        }
        assert_eq!(team.pending_messages(), MESSAGE_QUEUE_CAPACITY);
        assert_eq!(team.messages_dropped(), 3);
        assert_eq!(team.process_messages(0.0), MESSAGES_PER_UPDATE);
        assert_eq!(team.pending_messages(), MESSAGE_QUEUE_CAPACITY - MESSAGES_PER_UPDATE);
    }

    #[test]
    fn test_alert_records_contact() {
        let mut team = coordinator();
        team.add_member(1, Role::Assault).expect("add");
        team.post(TeamMessage::Alert {
            from: 1,
            alert: AlertKind::EnemySpotted {
                enemy: 9,
                position: Vec3::new(100.0, 0.0, 0.0),
                weapon: Weapon::Railgun,
            },
        });
        team.process_messages(1.0);
        assert_eq!(team.contacts().count(), 1);
    }

    #[test]
    fn test_command_redirects_squad() {
        let mut team = coordinator();
        team.add_member(1, Role::Assault).expect("add");
        let spot = Vec3::new(300.0, 300.0, 0.0);
        team.post(TeamMessage::Command {
            from: 1,
            squad: 0,
            destination: spot,
        });
        team.post(TeamMessage::Command {
            from: 1,
            squad: 3,
            destination: spot,
        });
        assert_eq!(team.process_messages(0.0), 2);
        assert_eq!(team.squads()[0].destination, Some(spot));
        assert_eq!(team.squads()[0].state, SquadState::Moving);
    }

    // ========================================================================
    // Coordinated tactics
    // ========================================================================

    #[test]
    fn test_crossfire_capped_and_spread() {
        let spots = crossfire_positions(Vec3::ZERO, Vec3::new(-500.0, 0.0, 0.0), 5);
        assert_eq!(spots.len(), MAX_ATTACKERS);
        for s in &spots {
            assert!((s.length() - CROSSFIRE_RADIUS).abs() < 1e-2);
        }
        assert!(spots[0].distance_to(spots[1]) > 100.0);
    }

    #[test]
    fn test_flank_positions_are_opposite() {
        let (left, right) = flank_positions(Vec3::ZERO, Vec3::new(500.0, 0.0, 0.0));
        assert!(left.y > 0.0 && right.y < 0.0);
        assert!(((left - right).length() - 2.0 * FLANK_DISTANCE).abs() < 1e-2);
    }

    #[test]
    fn test_cover_behind_is_away_from_threat() {
        let spot = cover_behind(Vec3::ZERO, Vec3::new(100.0, 0.0, 0.0));
        assert!(spot.x < 0.0);
    }

    #[test]
    fn test_coordinate_throttled_and_issues_orders() {
        let world = arena(&[(1, -400.0, 0.0, Team::Red), (2, -400.0, 100.0, Team::Red), (5, 400.0, 0.0, Team::Blue)]);
        let mut team = coordinator();
        team.add_member(1, Role::Assault).expect("add");
        team.add_member(2, Role::Support).expect("add");
        team.report_contact(5, Vec3::new(400.0, 0.0, 24.0), Weapon::Machinegun, 1, 0.0);

        assert!(team.coordinate(&world, 0.0));
        assert!(!team.coordinate(&world, 0.2));
        assert!(team.coordinate(&world, 0.6));

        assert!(team.planner().plan().is_some());
        assert!(team.order_for(1).is_some());
        assert!(team.order_for(2).is_some());
        assert!(team.effectiveness() > HIGH_EFFECTIVENESS);
    }

    #[test]
    fn test_low_effectiveness_disables_attacks() {
        let mut world = arena(&[(1, 0.0, 0.0, Team::Red)]);
        if let Some(e) = world.entity_mut(1) {
            e.health = 10;
            e.inventory.ammo = [0; crate::ai::weapons::WEAPON_COUNT];
        }
        let mut team = coordinator();
        team.add_member(1, Role::Assault).expect("add");
        team.coordinate(&world, 0.0);
        assert!(team.effectiveness() < LOW_EFFECTIVENESS);
        assert!(!team.coordinated_attacks());
        assert!(team.risk_tolerance() <= 0.2);
        // Weak squads fall back
        assert!(matches!(team.order_for(1), Some(Order::Retreat { .. }) | None));
    }

    #[test]
    fn test_member_effectiveness() {
        let mut m = TeamMember::new(1, Role::Assault);
        assert!((m.effectiveness() - 0.8).abs() < 1e-4);
        m.armor = 100;
        assert!((m.effectiveness() - 1.0).abs() < 1e-4);
    }
}
