//! Process-wide bot AI owner
//!
//! [`AiManager`] holds every bot by client slot, one [`TeamCoordinator`] per
//! team, and the cover set shared by all bots. The game drives it with
//! [`AiManager::frame`] once per server frame and feeds combat results back
//! through [`AiManager::record_event`].

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bitvec::prelude::*;
use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ai::character::CharacterProfile;
use crate::ai::constants::bot::MAX_CLIENTS;
use crate::ai::constants::cover::DEFAULT_GRID_SPACING;
use crate::ai::constants::skill::ADJUST_INTERVAL;
use crate::ai::controller::{BotController, BotState, ClientId, ThinkOutcome};
use crate::ai::cover::CoverManager;
use crate::ai::neural::NetworkError;
use crate::ai::skill::{adjust_difficulty, MetricKind, ProfileError, SkillProfile};
use crate::ai::team::{AlertKind, TeamCoordinator, TeamError, TeamMessage};
use crate::config::AiConfig;
use crate::metrics::AiMetrics;
use crate::world::{EntityId, Team, UserCmd, World};

#[derive(Error, Debug)]
pub enum BotError {
    #[error("Invalid client slot: {0}")]
    InvalidClient(usize),

    #[error("Slot occupied: {0}")]
    SlotOccupied(ClientId),

    #[error("No bot in {0}")]
    NotFound(ClientId),

    #[error("Team error: {0}")]
    Team(#[from] TeamError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Game-side happenings the AI learns from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BotEvent {
    ShotFired { shooter: EntityId, hit: bool },
    Damage { attacker: Option<EntityId>, victim: EntityId, amount: i32 },
    Kill { killer: Option<EntityId>, victim: EntityId },
    /// `None` for a draw
    RoundEnd { winner: Option<Team> },
}

/// What one frame did
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub thinks: usize,
    pub commands: Vec<(ClientId, UserCmd)>,
    pub coordinated: usize,
    pub adjustments: usize,
    pub training_passes: usize,
}

pub struct AiManager {
    config: AiConfig,
    bots: Vec<Option<Box<BotController>>>,
    teams: HashMap<Team, TeamCoordinator>,
    cover: CoverManager,
    think_mask: BitVec,
    metrics: Option<Arc<AiMetrics>>,
    rng: StdRng,
}

impl AiManager {
    pub fn new(config: AiConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            bots: (0..MAX_CLIENTS).map(|_| None).collect(),
            teams: HashMap::new(),
            cover: CoverManager::new(),
            think_mask: bitvec![0; MAX_CLIENTS],
            metrics: None,
            rng,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AiMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &AiConfig {
        &self.config
    }

    pub fn cover(&self) -> &CoverManager {
        &self.cover
    }

    pub fn bot(&self, client: ClientId) -> Option<&BotController> {
        self.bots[client.index()].as_deref()
    }

    pub fn bot_mut(&mut self, client: ClientId) -> Option<&mut BotController> {
        self.bots[client.index()].as_deref_mut()
    }

    pub fn bots(&self) -> impl Iterator<Item = &BotController> {
        self.bots.iter().filter_map(|b| b.as_deref())
    }

    pub fn bot_count(&self) -> usize {
        self.bots.iter().filter(|b| b.is_some()).count()
    }

    pub fn team(&self, team: Team) -> Option<&TeamCoordinator> {
        self.teams.get(&team)
    }

    fn bot_by_entity(&mut self, id: EntityId) -> Option<&mut BotController> {
        self.bots.get_mut(id)?.as_deref_mut()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Analyze a freshly loaded map for cover. Returns the point count.
    pub fn load_map<W: World + Sync + ?Sized>(&mut self, world: &W) -> usize {
        let count = self.cover.analyze_map(world, DEFAULT_GRID_SPACING);
        if let Some(m) = &self.metrics {
            m.cover_points.store(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Create a bot in `client`'s slot, loading its character, skill
    /// profile and checkpoints when available
    pub fn spawn_bot(&mut self, client: usize, name: &str, team: Team) -> Result<ClientId, BotError> {
        let character = CharacterProfile::load_or_default(self.config.character_dir.as_deref(), name, self.config.skill);
        self.spawn_character(client, character, team)
    }

    /// Create a bot from an already resolved character
    pub fn spawn_character(&mut self, client: usize, character: CharacterProfile, team: Team) -> Result<ClientId, BotError> {
        let id = ClientId::new(client).ok_or(BotError::InvalidClient(client))?;
        if self.bots[id.index()].is_some() {
            return Err(BotError::SlotOccupied(id));
        }

        let name = character.name.clone();
        let personality = character.personality;
        let mut bot = BotController::new(id, character, team, self.config.bot_settings(), self.config.seed)?;

        if let Some(dir) = self.config.profile_dir.clone() {
            let stem = profile_stem(bot.name());
            let path = skill_path(&dir, &stem);
            if path.exists() {
                let initial = bot.skill().current_skill;
                bot.set_skill(SkillProfile::load_or_new(&path, initial));
            }
            if let Some(agent) = bot.ppo_mut() {
                agent.load_checkpoints(&dir, &stem);
            }
        }

        if self.config.teamplay && matches!(team, Team::Red | Team::Blue) {
            let coordinator = match self.teams.entry(team) {
                hashbrown::hash_map::Entry::Occupied(e) => e.into_mut(),
                hashbrown::hash_map::Entry::Vacant(e) => e.insert(TeamCoordinator::new(team, &mut self.rng)?),
            };
            // A full team still gets the bot, just without a squad
            if let Err(e) = coordinator.add_member(id.entity(), personality.role()) {
                warn!(%id, ?team, error = %e, "Bot not assigned to a squad");
            }
        }

        info!(%id, name = %name, ?team, ?personality, "Bot spawned");
        self.bots[id.index()] = Some(Box::new(bot));
        if let Some(m) = &self.metrics {
            m.bots_active.store(self.bot_count() as u64, Ordering::Relaxed);
        }
        Ok(id)
    }

    pub fn remove_bot(&mut self, client: ClientId) -> Result<Box<BotController>, BotError> {
        let bot = self.bots[client.index()].take().ok_or(BotError::NotFound(client))?;
        self.cover.release(client.entity());
        if let Some(team) = self.teams.get_mut(&bot.team()) {
            if let Err(e) = team.remove_member(client.entity()) {
                debug!(%client, error = %e, "Bot had no squad");
            }
        }
        info!(%client, name = bot.name(), "Bot removed");
        if let Some(m) = &self.metrics {
            m.bots_active.store(self.bot_count() as u64, Ordering::Relaxed);
        }
        Ok(bot)
    }

    /// Write the bot's skill profile and learning checkpoints to the profile
    /// directory. Returns false when no directory is configured.
    pub fn save_bot(&self, client: ClientId) -> Result<bool, BotError> {
        let bot = self.bot(client).ok_or(BotError::NotFound(client))?;
        let Some(dir) = self.config.profile_dir.as_deref() else {
            return Ok(false);
        };
        std::fs::create_dir_all(dir)?;
        let stem = profile_stem(bot.name());
        bot.skill().save(&skill_path(dir, &stem))?;
        if let Some(agent) = bot.ppo() {
            agent.save(dir, &stem)?;
        }
        debug!(%client, dir = %dir.display(), "Bot saved");
        Ok(true)
    }

    pub fn set_match_info(&mut self, team: Team, team_score: i32, enemy_score: i32, time_remaining: f32) {
        if let Some(c) = self.teams.get_mut(&team) {
            c.set_match_info(team_score, enemy_score, time_remaining);
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn record_event(&mut self, event: BotEvent, now: f32) {
        match event {
            BotEvent::ShotFired { shooter, hit } => {
                if let Some(bot) = self.bot_by_entity(shooter) {
                    bot.on_shot(hit);
                }
            }
            BotEvent::Damage { attacker, victim, amount } => {
                if let Some(bot) = self.bot_by_entity(victim) {
                    bot.on_damaged(attacker, amount, now);
                    if attacker.is_some_and(|a| a != victim) {
                        bot.on_shot_at(true);
                    }
                }
                if let Some(bot) = attacker.filter(|a| *a != victim).and_then(|a| self.bot_by_entity(a)) {
                    bot.on_damage_dealt(amount);
                }
            }
            BotEvent::Kill { killer, victim } => {
                if let Some(bot) = killer.filter(|k| *k != victim).and_then(|k| self.bot_by_entity(k)) {
                    bot.on_kill();
                }
                let team = match self.bot_by_entity(victim) {
                    Some(bot) => {
                        bot.on_death();
                        Some(bot.team())
                    }
                    None => None,
                };
                if let Some(coordinator) = team.and_then(|t| self.teams.get_mut(&t)) {
                    coordinator.post(TeamMessage::Alert {
                        from: victim,
                        alert: AlertKind::MemberDown { member: victim },
                    });
                }
            }
            BotEvent::RoundEnd { winner } => {
                for bot in self.bots.iter_mut().flatten() {
                    let won = winner == Some(bot.team());
                    bot.skill_parts_mut().1.record_round(won);
                }
                for (team, coordinator) in self.teams.iter_mut() {
                    if let Some(strategy) = coordinator.planner().plan().map(|p| p.strategy) {
                        coordinator.planner_mut().record_outcome(strategy, winner == Some(*team));
                    }
                }
                info!(?winner, "Round ended");
            }
        }
    }

    // ========================================================================
    // Frame
    // ========================================================================

    /// Think every due bot, apply the shared-state side effects, then run
    /// team coordination
    pub fn frame<W: World + Sync + ?Sized>(&mut self, world: &W, now: f32) -> FrameReport {
        let mut report = FrameReport::default();
        if !self.config.enabled {
            return report;
        }
        let started = Instant::now();

        if self.config.teamplay {
            for bot in self.bots.iter_mut().flatten() {
                let order = self
                    .teams
                    .get(&bot.team())
                    .and_then(|c| c.order_for(bot.client().entity()))
                    .copied();
                bot.set_order(order);
            }
        }

        self.think_mask.fill(false);
        for (i, slot) in self.bots.iter().enumerate() {
            if slot.as_ref().is_some_and(|b| b.is_due(now)) {
                self.think_mask.set(i, true);
            }
        }

        let cover = &self.cover;
        let mask = &self.think_mask;
        let outcomes: Vec<(usize, ThinkOutcome)> = if self.config.parallel_think {
            self.bots
                .par_iter_mut()
                .enumerate()
                .filter(|(i, _)| mask[*i])
                .filter_map(|(i, slot)| slot.as_deref_mut().map(|b| (i, b.think(world, cover, now))))
                .collect()
        } else {
            self.bots
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| mask[*i])
                .filter_map(|(i, slot)| slot.as_deref_mut().map(|b| (i, b.think(world, cover, now))))
                .collect()
        };
        report.thinks = outcomes.len();

        for (slot, outcome) in outcomes {
            self.apply_outcome(slot, outcome, now, &mut report);
        }

        if self.config.teamplay {
            for coordinator in self.teams.values_mut() {
                if coordinator.coordinate(world, now) {
                    report.coordinated += 1;
                }
            }
        }

        self.publish(&report, started);
        report
    }

    fn apply_outcome(&mut self, slot: usize, outcome: ThinkOutcome, now: f32, report: &mut FrameReport) {
        let Some(bot) = self.bots[slot].as_deref_mut() else {
            return;
        };
        let entity = bot.client().entity();

        if outcome.release_cover {
            self.cover.release(entity);
        }
        if let Some(id) = outcome.claim_cover {
            if self.cover.claim(id, entity, now) {
                if let Some(m) = &self.metrics {
                    m.cover_claims.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                bot.cover_denied();
            }
        }

        if self.config.teamplay {
            if let Some(team) = self.teams.get_mut(&bot.team()) {
                for (enemy, position, weapon) in &outcome.sightings {
                    team.report_contact(*enemy, *position, *weapon, entity, now);
                }
                if let Some((kind, position)) = outcome.request {
                    team.post(TeamMessage::Request {
                        from: entity,
                        kind,
                        position,
                    });
                }
            }
        }

        if outcome.training.is_some() {
            report.training_passes += 1;
        }
        if bot.state() != BotState::Dead && adapt_skill(bot, now).is_some() {
            report.adjustments += 1;
        }
        report.commands.push((bot.client(), outcome.cmd));
    }

    fn publish(&self, report: &FrameReport, started: Instant) {
        let Some(m) = &self.metrics else {
            return;
        };
        let bots = || self.bots.iter().flatten();
        m.bots_alive
            .store(bots().filter(|b| b.state() != BotState::Dead).count() as u64, Ordering::Relaxed);
        m.thinks.fetch_add(report.thinks as u64, Ordering::Relaxed);
        m.perception_scans
            .store(bots().map(|b| b.perception().scans()).sum(), Ordering::Relaxed);
        m.visible_entities
            .store(bots().map(|b| b.perception().visible().len() as u64).sum(), Ordering::Relaxed);
        m.ppo_updates
            .store(bots().filter_map(|b| b.ppo()).map(|a| a.updates()).sum(), Ordering::Relaxed);
        m.difficulty_adjustments
            .fetch_add(report.adjustments as u64, Ordering::Relaxed);
        m.plans_created
            .store(self.teams.values().map(|t| t.planner().plans_created()).sum(), Ordering::Relaxed);
        m.replans.store(self.teams.values().map(|t| t.replans()).sum(), Ordering::Relaxed);
        m.messages_dropped
            .store(self.teams.values().map(|t| t.messages_dropped()).sum(), Ordering::Relaxed);
        m.record_frame_time(started.elapsed());
    }
}

/// Feed the skill metrics and retune once the adjustment interval has passed
fn adapt_skill(bot: &mut BotController, now: f32) -> Option<f32> {
    let last = bot.skill().last_adjustment.unwrap_or(0.0);
    if now - last < ADJUST_INTERVAL {
        return None;
    }
    let stats = bot.stats();
    let accuracy = bot.combat().accuracy();
    let (skill, state) = bot.skill_parts_mut();

    let bot_kd = stats.kills as f32 / stats.deaths.max(1) as f32;
    let bot_damage = stats.damage_dealt as f32 / stats.damage_taken.max(1) as f32;
    let player_damage = stats.damage_taken as f32 / stats.damage_dealt.max(1) as f32;
    skill.update_metrics(MetricKind::Accuracy, state.recent_accuracy, accuracy);
    skill.update_metrics(MetricKind::KillDeathRatio, state.recent_kd_ratio, bot_kd);
    skill.update_metrics(MetricKind::DamageRatio, player_damage, bot_damage);
    adjust_difficulty(skill, state, now)
}

fn profile_stem(name: &str) -> String {
    name.to_lowercase()
}

fn skill_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.skill"))
}
