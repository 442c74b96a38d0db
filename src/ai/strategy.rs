//! Team-level strategic planning
//!
//! A plan is built in one pass: assess the situation, score the eight
//! strategies with the strategy network, adjust by history, apply
//! overrides, then expand the chosen strategy into goals and tactical
//! objectives.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ai::constants::strategy::{
    ENDGAME_TIME, MAX_GOALS, MAX_REGION_OBJECTIVES, MIN_EFFECTIVENESS, MIN_EXECUTION_TIME,
    MOMENTUM_OVERRIDE, OBJECTIVE_DEADLINE, OBJECTIVE_RADIUS, PLAN_MAX_AGE, SITUATION_FEATURES,
    STRATEGY_COUNT,
};
use crate::ai::neural::{Activation, LayerSpec, NetworkError, NeuralNetwork};
use crate::util::vec3::Vec3;
use crate::world::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Strategy {
    Aggressive = 0,
    Defensive,
    Balanced,
    Guerrilla,
    Control,
    Objective,
    Support,
    Ambush,
}

impl Strategy {
    pub const ALL: [Strategy; STRATEGY_COUNT] = [
        Strategy::Aggressive,
        Strategy::Defensive,
        Strategy::Balanced,
        Strategy::Guerrilla,
        Strategy::Control,
        Strategy::Objective,
        Strategy::Support,
        Strategy::Ambush,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Fixed behavior preset
    pub fn weights(self) -> StrategyWeights {
        let w = |aggression, defense, objective_focus, resource_control, coordination, risk_tolerance, adaptability| {
            StrategyWeights {
                aggression,
                defense,
                objective_focus,
                resource_control,
                coordination,
                risk_tolerance,
                adaptability,
            }
        };
        match self {
            Strategy::Aggressive => w(0.9, 0.2, 0.3, 0.4, 0.5, 0.8, 0.4),
            Strategy::Defensive => w(0.2, 0.9, 0.4, 0.5, 0.7, 0.2, 0.3),
            Strategy::Balanced => w(0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5),
            Strategy::Guerrilla => w(0.7, 0.3, 0.2, 0.3, 0.3, 0.6, 0.9),
            Strategy::Control => w(0.5, 0.6, 0.6, 0.9, 0.7, 0.4, 0.4),
            Strategy::Objective => w(0.4, 0.5, 0.9, 0.4, 0.8, 0.5, 0.5),
            Strategy::Support => w(0.3, 0.6, 0.5, 0.4, 0.9, 0.3, 0.6),
            Strategy::Ambush => w(0.6, 0.7, 0.3, 0.3, 0.6, 0.4, 0.7),
        }
    }

    /// Top-level goals this strategy generates, most important first
    fn goal_kinds(self, s: &SituationAssessment, snapshot: &TeamSnapshot) -> Vec<GoalKind> {
        let weakest = snapshot
            .enemies
            .iter()
            .filter(|e| e.alive)
            .min_by_key(|e| e.health + e.armor)
            .map(|e| e.id);
        let defend = snapshot.defend_point.unwrap_or(s.team_center);
        let capture = snapshot.high_value.first().copied().unwrap_or_else(|| snapshot.map_center());
        match self {
            Strategy::Aggressive => vec![GoalKind::Eliminate { target: None }, GoalKind::Dominate],
            Strategy::Defensive => vec![GoalKind::Defend { position: defend }, GoalKind::Survive],
            Strategy::Balanced => vec![GoalKind::Eliminate { target: None }, GoalKind::Collect],
            Strategy::Guerrilla => vec![GoalKind::Eliminate { target: weakest }, GoalKind::Survive],
            Strategy::Control => vec![GoalKind::Control, GoalKind::Defend { position: defend }],
            Strategy::Objective => vec![GoalKind::Capture { position: capture }, GoalKind::Defend { position: defend }],
            Strategy::Support => vec![GoalKind::Support { ally: None }, GoalKind::Survive],
            Strategy::Ambush => vec![GoalKind::Defend { position: capture }, GoalKind::Eliminate { target: None }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyWeights {
    pub aggression: f32,
    pub defense: f32,
    pub objective_focus: f32,
    pub resource_control: f32,
    pub coordination: f32,
    pub risk_tolerance: f32,
    pub adaptability: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Outcome {
    Winning,
    Losing,
    #[default]
    Stalemate,
}

/// One unit as the planner sees it
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UnitSnapshot {
    pub id: EntityId,
    pub position: Vec3,
    pub health: i32,
    pub armor: i32,
    /// 0..1
    pub weapon_tier: f32,
    pub alive: bool,
}

impl UnitSnapshot {
    fn strength(&self) -> f32 {
        if !self.alive {
            return 0.0;
        }
        1.0 + (self.health + self.armor).max(0) as f32 / 200.0 + self.weapon_tier
    }
}

/// Planner input for one team
#[derive(Debug, Clone, Default)]
pub struct TeamSnapshot {
    pub members: Vec<UnitSnapshot>,
    /// Known enemies, from team perception
    pub enemies: Vec<UnitSnapshot>,
    pub team_score: i32,
    pub enemy_score: i32,
    pub time_remaining: f32,
    pub bounds: (Vec3, Vec3),
    /// Pickups worth fighting for
    pub high_value: Vec<Vec3>,
    pub defend_point: Option<Vec3>,
}

impl TeamSnapshot {
    pub fn map_center(&self) -> Vec3 {
        (self.bounds.0 + self.bounds.1) * 0.5
    }

    /// Centers of the four map quadrants
    pub fn regions(&self) -> [Vec3; 4] {
        let (lo, hi) = self.bounds;
        let c = self.map_center();
        let q = |x: f32, y: f32| Vec3::new(x, y, lo.z);
        [
            q((lo.x + c.x) * 0.5, (lo.y + c.y) * 0.5),
            q((c.x + hi.x) * 0.5, (lo.y + c.y) * 0.5),
            q((lo.x + c.x) * 0.5, (c.y + hi.y) * 0.5),
            q((c.x + hi.x) * 0.5, (c.y + hi.y) * 0.5),
        ]
    }
}

fn centroid(units: &[UnitSnapshot]) -> Option<Vec3> {
    let alive: Vec<Vec3> = units.iter().filter(|u| u.alive).map(|u| u.position).collect();
    if alive.is_empty() {
        None
    } else {
        Some(alive.iter().fold(Vec3::ZERO, |a, p| a + *p) * (1.0 / alive.len() as f32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SituationAssessment {
    pub team_strength: f32,
    pub enemy_strength: f32,
    pub strength_ratio: f32,
    /// -1..1, positive when the team holds the middle of the map
    pub positional_advantage: f32,
    /// -1..1, weapon tier difference
    pub resource_advantage: f32,
    /// -1..1, change of the balance since the previous assessment
    pub momentum: f32,
    pub outcome: Outcome,
    pub balance: f32,
    pub time_remaining: f32,
    pub score_delta: i32,
    pub team_alive: usize,
    pub enemy_alive: usize,
    pub team_center: Vec3,
}

/// Assess a team snapshot relative to the previous assessment
pub fn assess_situation(snapshot: &TeamSnapshot, previous: Option<&SituationAssessment>) -> SituationAssessment {
    let team_strength: f32 = snapshot.members.iter().map(UnitSnapshot::strength).sum();
    let enemy_strength: f32 = snapshot.enemies.iter().map(UnitSnapshot::strength).sum();
    let strength_ratio = if enemy_strength > 0.0 {
        team_strength / enemy_strength
    } else if team_strength > 0.0 {
        3.0
    } else {
        1.0
    };

    let center = snapshot.map_center();
    let extent = ((snapshot.bounds.1 - snapshot.bounds.0).length_xy() * 0.5).max(1.0);
    let team_center = centroid(&snapshot.members).unwrap_or(center);
    let positional_advantage = match centroid(&snapshot.enemies) {
        Some(enemy_center) => {
            ((enemy_center.distance_to(center) - team_center.distance_to(center)) / extent).clamp(-1.0, 1.0)
        }
        None => 0.0,
    };

    let mean_tier = |units: &[UnitSnapshot]| {
        let alive: Vec<f32> = units.iter().filter(|u| u.alive).map(|u| u.weapon_tier).collect();
        if alive.is_empty() {
            0.0
        } else {
            alive.iter().sum::<f32>() / alive.len() as f32
        }
    };
    let resource_advantage = (mean_tier(&snapshot.members) - mean_tier(&snapshot.enemies)).clamp(-1.0, 1.0);

    let score_delta = snapshot.team_score - snapshot.enemy_score;
    let total = team_strength + enemy_strength;
    let balance = if total > 0.0 { (team_strength - enemy_strength) / total } else { 0.0 } + 0.1 * score_delta as f32;
    let momentum = previous.map_or(0.0, |p| ((balance - p.balance) * 2.0).clamp(-1.0, 1.0));

    let outcome = if strength_ratio > 1.2 || (strength_ratio > 1.0 && momentum > 0.2) || score_delta >= 5 {
        Outcome::Winning
    } else if strength_ratio < 0.8 || (strength_ratio < 1.0 && momentum < -0.2) || score_delta <= -5 {
        Outcome::Losing
    } else {
        Outcome::Stalemate
    };

    SituationAssessment {
        team_strength,
        enemy_strength,
        strength_ratio,
        positional_advantage,
        resource_advantage,
        momentum,
        outcome,
        balance,
        time_remaining: snapshot.time_remaining,
        score_delta,
        team_alive: snapshot.members.iter().filter(|u| u.alive).count(),
        enemy_alive: snapshot.enemies.iter().filter(|u| u.alive).count(),
        team_center,
    }
}

/// Top-level goal, each variant carrying only what it needs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GoalKind {
    Eliminate { target: Option<EntityId> },
    Dominate,
    Defend { position: Vec3 },
    Survive,
    Capture { position: Vec3 },
    Control,
    Collect,
    Support { ally: Option<EntityId> },
}

impl GoalKind {
    /// (priority tier, value, cost, success probability); tier 1 is most urgent
    fn profile(&self) -> (u8, f32, f32, f32) {
        match self {
            GoalKind::Eliminate { .. } => (1, 1.0, 0.6, 0.5),
            GoalKind::Dominate => (2, 0.9, 0.8, 0.4),
            GoalKind::Defend { .. } => (1, 0.8, 0.4, 0.7),
            GoalKind::Survive => (2, 0.6, 0.2, 0.8),
            GoalKind::Capture { .. } => (1, 1.0, 0.5, 0.5),
            GoalKind::Control => (2, 0.8, 0.7, 0.5),
            GoalKind::Collect => (3, 0.5, 0.3, 0.8),
            GoalKind::Support { .. } => (2, 0.6, 0.3, 0.7),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategicGoal {
    pub kind: GoalKind,
    pub priority: u8,
    pub value: f32,
    pub cost: f32,
    pub success_probability: f32,
    /// Bots currently working on this goal
    pub assigned: Vec<EntityId>,
}

impl StrategicGoal {
    fn new(kind: GoalKind) -> Self {
        let (priority, value, cost, success_probability) = kind.profile();
        Self {
            kind,
            priority,
            value,
            cost,
            success_probability,
            assigned: Vec::new(),
        }
    }

    /// Value over cost, weighted by inverse priority tier
    pub fn utility(&self) -> f32 {
        self.value / self.cost.max(0.01) / self.priority.max(1) as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ObjectiveKind {
    SearchAndDestroy { target: Option<EntityId> },
    Capture,
    Hold,
    ControlRegion { region: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectiveStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TacticalObjective {
    pub id: u32,
    pub kind: ObjectiveKind,
    /// Index of the parent goal in the plan
    pub goal: usize,
    pub position: Vec3,
    pub radius: f32,
    pub required_agents: usize,
    pub status: ObjectiveStatus,
    pub assigned_squad: Option<usize>,
    pub created_at: f32,
    pub deadline: f32,
}

impl TacticalObjective {
    pub fn is_open(&self) -> bool {
        matches!(self.status, ObjectiveStatus::Pending | ObjectiveStatus::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategicPlan {
    pub strategy: Strategy,
    pub weights: StrategyWeights,
    pub goals: Vec<StrategicGoal>,
    pub objectives: Vec<TacticalObjective>,
    pub created_at: f32,
    pub confidence: f32,
    pub assessment: SituationAssessment,
}

impl StrategicPlan {
    pub fn age(&self, now: f32) -> f32 {
        now - self.created_at
    }

    pub fn active_objectives(&self) -> impl Iterator<Item = &TacticalObjective> {
        self.objectives.iter().filter(|o| o.is_open())
    }

    fn count(&self, status: ObjectiveStatus) -> usize {
        self.objectives.iter().filter(|o| o.status == status).count()
    }

    /// Completed share of finished objectives; 0.5 before anything finished
    pub fn effectiveness(&self) -> f32 {
        let done = self.count(ObjectiveStatus::Completed);
        let failed = self.count(ObjectiveStatus::Failed);
        if done + failed == 0 {
            0.5
        } else {
            done as f32 / (done + failed) as f32
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub successes: u32,
    pub failures: u32,
    /// Running effectiveness, 0.5 until used
    pub effectiveness: f32,
}

/// Plan builder and tracker for one team
#[derive(Debug, Clone)]
pub struct StrategicPlanner {
    network: NeuralNetwork,
    history: [StrategyRecord; STRATEGY_COUNT],
    plan: Option<StrategicPlan>,
    last_assessment: Option<SituationAssessment>,
    last_features: Option<[f32; SITUATION_FEATURES]>,
    next_objective_id: u32,
    plans_created: u64,
    pub learning: bool,
}

impl StrategicPlanner {
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Result<Self, NetworkError> {
        let network = NeuralNetwork::new(
            SITUATION_FEATURES,
            &[
                LayerSpec::new(32, Activation::ReLU),
                LayerSpec::new(STRATEGY_COUNT, Activation::Softmax),
            ],
            rng,
        )?;
        let record = StrategyRecord {
            effectiveness: 0.5,
            ..Default::default()
        };
        Ok(Self {
            network,
            history: [record; STRATEGY_COUNT],
            plan: None,
            last_assessment: None,
            last_features: None,
            next_objective_id: 0,
            plans_created: 0,
            learning: false,
        })
    }

    pub fn plan(&self) -> Option<&StrategicPlan> {
        self.plan.as_ref()
    }

    pub fn plan_mut(&mut self) -> Option<&mut StrategicPlan> {
        self.plan.as_mut()
    }

    pub fn history(&self, strategy: Strategy) -> StrategyRecord {
        self.history[strategy.index()]
    }

    pub fn plans_created(&self) -> u64 {
        self.plans_created
    }

    pub fn last_assessment(&self) -> Option<&SituationAssessment> {
        self.last_assessment.as_ref()
    }

    pub fn situation_features(&self, s: &SituationAssessment) -> [f32; SITUATION_FEATURES] {
        let mut f = [0.0; SITUATION_FEATURES];
        f[0] = (s.team_strength / 10.0).min(1.0);
        f[1] = (s.enemy_strength / 10.0).min(1.0);
        f[2] = (s.strength_ratio / 3.0).min(1.0);
        f[3] = s.positional_advantage;
        f[4] = s.resource_advantage;
        f[5] = s.momentum;
        f[6] = (s.time_remaining / 600.0).clamp(0.0, 1.0);
        f[7] = (s.score_delta as f32 / 10.0).clamp(-1.0, 1.0);
        f[8] = (s.team_alive as f32 / 8.0).min(1.0);
        f[9] = (s.enemy_alive as f32 / 8.0).min(1.0);
        f[10] = match s.outcome {
            Outcome::Winning => 1.0,
            Outcome::Stalemate => 0.0,
            Outcome::Losing => -1.0,
        };
        for (slot, record) in f[11..].iter_mut().zip(self.history.iter()) {
            *slot = record.effectiveness;
        }
        f
    }

    /// Network scores adjusted by how each strategy fared before
    fn score_strategies(&self, features: &[f32; SITUATION_FEATURES]) -> Result<[f32; STRATEGY_COUNT], NetworkError> {
        let outputs = self.network.predict(features)?;
        let mut scores = [0.0; STRATEGY_COUNT];
        for (i, score) in scores.iter_mut().enumerate() {
            let record = self.history[i];
            let mut s = outputs.get(i).copied().unwrap_or(0.0);
            if record.successes > record.failures {
                s *= 1.2;
            } else if record.failures > 2 * record.successes {
                s *= 0.5;
            }
            *score = s;
        }
        Ok(scores)
    }

    /// Situation-driven overrides of the network's pick
    pub fn apply_overrides(chosen: Strategy, s: &SituationAssessment) -> Strategy {
        if s.outcome == Outcome::Losing && s.momentum < MOMENTUM_OVERRIDE {
            return if s.strength_ratio >= 0.6 { Strategy::Aggressive } else { Strategy::Guerrilla };
        }
        if s.outcome == Outcome::Winning && s.time_remaining < ENDGAME_TIME {
            return Strategy::Defensive;
        }
        chosen
    }

    /// Build and install a new plan, closing out the previous one
    pub fn create_plan(&mut self, snapshot: &TeamSnapshot, now: f32) -> Result<&StrategicPlan, NetworkError> {
        if let Some(old) = self.plan.take() {
            self.record_outcome(old.strategy, old.effectiveness() >= 0.5);
        }

        let assessment = assess_situation(snapshot, self.last_assessment.as_ref());
        let features = self.situation_features(&assessment);
        let scores = self.score_strategies(&features)?;
        let picked = Strategy::ALL
            .into_iter()
            .max_by(|a, b| scores[a.index()].total_cmp(&scores[b.index()]))
            .unwrap_or(Strategy::Balanced);
        let strategy = Self::apply_overrides(picked, &assessment);
        debug!(?picked, ?strategy, outcome = ?assessment.outcome, momentum = assessment.momentum, "Strategy chosen");

        let mut goals: Vec<StrategicGoal> = strategy
            .goal_kinds(&assessment, snapshot)
            .into_iter()
            .take(MAX_GOALS)
            .map(StrategicGoal::new)
            .collect();
        goals.sort_by(|a, b| b.utility().total_cmp(&a.utility()));

        let mut objectives = Vec::new();
        for (index, goal) in goals.iter().enumerate() {
            self.decompose(index, goal, snapshot, &assessment, now, &mut objectives);
        }

        let base = match assessment.outcome {
            Outcome::Winning => 0.8,
            Outcome::Stalemate => 0.5,
            Outcome::Losing => 0.3,
        };
        let historical = self.history[strategy.index()].effectiveness;
        let goal_success = if goals.is_empty() {
            0.0
        } else {
            goals.iter().map(|g| g.success_probability).sum::<f32>() / goals.len() as f32
        };
        let confidence = (0.4 * base + 0.3 * historical + 0.3 * goal_success).clamp(0.0, 1.0);

        self.plans_created += 1;
        self.last_assessment = Some(assessment);
        self.last_features = Some(features);
        info!(
            ?strategy,
            goals = goals.len(),
            objectives = objectives.len(),
            confidence,
            "Strategic plan created"
        );
        let plan: &StrategicPlan = self.plan.insert(StrategicPlan {
            strategy,
            weights: strategy.weights(),
            goals,
            objectives,
            created_at: now,
            confidence,
            assessment,
        });
        Ok(plan)
    }

    fn push_objective(
        &mut self,
        out: &mut Vec<TacticalObjective>,
        kind: ObjectiveKind,
        goal: usize,
        position: Vec3,
        now: f32,
    ) {
        out.push(TacticalObjective {
            id: self.next_objective_id,
            kind,
            goal,
            position,
            radius: OBJECTIVE_RADIUS,
            required_agents: match kind {
                ObjectiveKind::SearchAndDestroy { .. } | ObjectiveKind::Capture => 2,
                ObjectiveKind::Hold | ObjectiveKind::ControlRegion { .. } => 1,
            },
            status: ObjectiveStatus::Pending,
            assigned_squad: None,
            created_at: now,
            deadline: now + OBJECTIVE_DEADLINE,
        });
        self.next_objective_id = self.next_objective_id.wrapping_add(1);
    }

    /// Expand a goal into tactical objectives
    fn decompose(
        &mut self,
        index: usize,
        goal: &StrategicGoal,
        snapshot: &TeamSnapshot,
        s: &SituationAssessment,
        now: f32,
        out: &mut Vec<TacticalObjective>,
    ) {
        let regions = snapshot.regions();
        match goal.kind {
            GoalKind::Eliminate { target } => {
                // Known enemies first, then the map regions
                let mut spots: Vec<Vec3> = snapshot.enemies.iter().filter(|e| e.alive).map(|e| e.position).collect();
                spots.extend(regions.iter().copied());
                for position in spots.into_iter().take(3) {
                    self.push_objective(out, ObjectiveKind::SearchAndDestroy { target }, index, position, now);
                }
            }
            GoalKind::Capture { position } => {
                self.push_objective(out, ObjectiveKind::Capture, index, position, now);
            }
            GoalKind::Defend { position } => {
                let side = Vec3::new(OBJECTIVE_RADIUS * 0.5, 0.0, 0.0);
                self.push_objective(out, ObjectiveKind::Hold, index, position + side, now);
                self.push_objective(out, ObjectiveKind::Hold, index, position - side, now);
            }
            GoalKind::Control => {
                for (region, center) in regions.iter().enumerate().take(MAX_REGION_OBJECTIVES) {
                    self.push_objective(out, ObjectiveKind::ControlRegion { region }, index, *center, now);
                }
            }
            GoalKind::Dominate => {
                let center = snapshot.map_center();
                self.push_objective(out, ObjectiveKind::ControlRegion { region: usize::MAX }, index, center, now);
            }
            GoalKind::Survive => {
                self.push_objective(out, ObjectiveKind::Hold, index, s.team_center, now);
            }
            GoalKind::Collect => {
                let spot = snapshot.high_value.first().copied().unwrap_or_else(|| snapshot.map_center());
                self.push_objective(out, ObjectiveKind::Capture, index, spot, now);
            }
            GoalKind::Support { ally } => {
                let position = ally
                    .and_then(|id| snapshot.members.iter().find(|m| m.id == id))
                    .map_or(s.team_center, |m| m.position);
                self.push_objective(out, ObjectiveKind::Hold, index, position, now);
            }
        }
    }

    /// Any one of: no plan; plan too old; ineffective after the minimum
    /// execution time; more than half the objectives failed; enemy more
    /// than twice as strong; nothing left to do
    pub fn needs_replanning(&self, now: f32) -> bool {
        let Some(plan) = &self.plan else {
            return true;
        };
        let age = plan.age(now);
        if age > PLAN_MAX_AGE {
            return true;
        }
        if age >= MIN_EXECUTION_TIME && plan.effectiveness() < MIN_EFFECTIVENESS {
            return true;
        }
        if plan.count(ObjectiveStatus::Failed) * 2 > plan.objectives.len() {
            return true;
        }
        if let Some(s) = &self.last_assessment {
            if s.enemy_strength > 2.0 * s.team_strength {
                return true;
            }
        }
        plan.active_objectives().next().is_none()
    }

    /// Refresh the strength picture without replanning
    pub fn observe(&mut self, snapshot: &TeamSnapshot) {
        let assessment = assess_situation(snapshot, self.last_assessment.as_ref());
        self.last_assessment = Some(assessment);
    }

    /// Advance objective status from member positions. Returns how many
    /// objectives changed state.
    pub fn update_objectives(&mut self, snapshot: &TeamSnapshot, now: f32) -> usize {
        let Some(plan) = &mut self.plan else {
            return 0;
        };
        let mut changed = 0;
        for obj in plan.objectives.iter_mut().filter(|o| o.is_open()) {
            if now > obj.deadline {
                obj.status = ObjectiveStatus::Failed;
                changed += 1;
                continue;
            }
            let reached = snapshot
                .members
                .iter()
                .any(|m| m.alive && m.position.flat().distance_to(obj.position.flat()) <= obj.radius);
            let done = match obj.kind {
                ObjectiveKind::SearchAndDestroy { target: Some(id) } => {
                    snapshot.enemies.iter().any(|e| e.id == id && !e.alive)
                }
                ObjectiveKind::SearchAndDestroy { target: None } => {
                    reached
                        && !snapshot
                            .enemies
                            .iter()
                            .any(|e| e.alive && e.position.flat().distance_to(obj.position.flat()) <= obj.radius)
                }
                ObjectiveKind::Capture | ObjectiveKind::Hold | ObjectiveKind::ControlRegion { .. } => {
                    reached && now - obj.created_at >= MIN_EXECUTION_TIME
                }
            };
            if done {
                obj.status = ObjectiveStatus::Completed;
                changed += 1;
            } else if obj.status == ObjectiveStatus::Pending && obj.assigned_squad.is_some() {
                obj.status = ObjectiveStatus::Active;
            }
        }
        changed
    }

    /// Fold a finished plan into the strategy history and, when learning,
    /// nudge the network toward strategies that worked
    pub fn record_outcome(&mut self, strategy: Strategy, success: bool) {
        let record = &mut self.history[strategy.index()];
        if success {
            record.successes += 1;
        } else {
            record.failures += 1;
        }
        record.effectiveness = 0.8 * record.effectiveness + 0.2 * if success { 1.0 } else { 0.0 };

        if self.learning && success {
            if let Some(features) = self.last_features {
                let mut target = [0.0; STRATEGY_COUNT];
                target[strategy.index()] = 1.0;
                // Deterministic pass: no dropout in this network
                let mut rng = rand::rngs::mock::StepRng::new(0, 1);
                if self.network.forward(&features, &mut rng).is_ok() && self.network.backward(&target).is_ok() {
                    self.network.update_weights();
                }
            }
        }
    }
}
