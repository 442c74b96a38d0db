//! Movement tactics: dodges, strafing, advanced techniques and path following

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ai::constants::movement::{
    BUNNY_HOP_MIN_SPEED, DIAGONAL_DURATION, DUCK_DURATION, JUMP_DODGE_DURATION,
    ROCKET_JUMP_MIN_HEALTH, ROCKET_JUMP_MIN_HEIGHT, SERPENTINE_FREQUENCY, SIDESTEP_DURATION,
    SINE_STRAFE_FREQUENCY, SLIDE_DURATION, SLIDE_SPEED, STRAFE_JUMP_MIN_SPEED, STRAFE_MIN_DWELL,
    STRAFE_PROBE_DISTANCE, STRAFE_TIE_EPSILON, STUCK_DISTANCE, STUCK_TIME, VERTICAL_THREAT,
    WALL_PROBE_DISTANCE, WALL_RUN_MIN_SPEED, WAYPOINT_REACHED,
};
use crate::ai::constants::perception::EYE_HEIGHT;
use crate::ai::detail;
use crate::ai::weapons::Weapon;
use crate::util::vec3::Vec3;
use crate::world::{ContentMask, EntityState, World, PLAYER_MAXS, PLAYER_MINS};

/// How a bot likes to move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MovementStyle {
    #[default]
    Standard,
    Evasive,
    Aggressive,
    Tactical,
    Parkour,
}

impl MovementStyle {
    pub fn strafe_pattern(self) -> StrafePattern {
        match self {
            MovementStyle::Standard | MovementStyle::Parkour => StrafePattern::Sinusoidal,
            MovementStyle::Evasive => StrafePattern::Random,
            MovementStyle::Aggressive => StrafePattern::Serpentine,
            MovementStyle::Tactical => StrafePattern::Predictive,
        }
    }

    /// Multiplier on dodge strength
    pub fn dodge_intensity(self) -> f32 {
        match self {
            MovementStyle::Standard => 1.0,
            MovementStyle::Evasive => 1.3,
            MovementStyle::Aggressive => 0.8,
            MovementStyle::Tactical => 1.0,
            MovementStyle::Parkour => 1.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DodgeType {
    None,
    Sidestep,
    Diagonal,
    Jump,
    Duck,
    Slide,
}

impl DodgeType {
    pub fn duration(self) -> f32 {
        match self {
            DodgeType::None => 0.0,
            DodgeType::Sidestep => SIDESTEP_DURATION,
            DodgeType::Diagonal => DIAGONAL_DURATION,
            DodgeType::Jump => JUMP_DODGE_DURATION,
            DodgeType::Duck => DUCK_DURATION,
            DodgeType::Slide => SLIDE_DURATION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrafePattern {
    Sinusoidal,
    Random,
    Serpentine,
    Predictive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Technique {
    StrafeJump,
    BunnyHop,
    RocketJump,
    WallRun,
    WallJump,
    AirControl,
}

/// What movement needs to know about the bot this tick
#[derive(Debug, Clone, Copy, Default)]
pub struct MovementState {
    pub position: Vec3,
    pub velocity: Vec3,
    pub on_ground: bool,
    pub health: i32,
    pub yaw: f32,
    pub rocket_ammo: i32,
}

impl MovementState {
    pub fn from_entity(e: &EntityState) -> Self {
        let rocket_ammo = if e.inventory.has(Weapon::RocketLauncher) {
            e.inventory.ammo(Weapon::RocketLauncher)
        } else {
            0
        };
        Self {
            position: e.position,
            velocity: e.velocity,
            on_ground: e.on_ground,
            health: e.health,
            yaw: e.angles.y,
            rocket_ammo,
        }
    }

    #[inline]
    pub fn speed(&self) -> f32 {
        self.velocity.length_xy()
    }
}

/// Desired movement for one tick in world space
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MoveIntent {
    /// Horizontal wish direction, length up to 1
    pub direction: Vec3,
    pub jump: bool,
    pub crouch: bool,
    pub walk: bool,
    /// Fire regardless of the combat decision (rocket jump)
    pub fire: bool,
    /// Pitch to look at instead of the aim target
    pub pitch_override: Option<f32>,
}

impl MoveIntent {
    pub fn toward(direction: Vec3) -> Self {
        Self {
            direction: direction.flat().clamp_length(1.0),
            ..Default::default()
        }
    }

    /// Command-space (forward, right) for a view yaw in degrees
    pub fn relative_to_yaw(&self, yaw: f32) -> (f32, f32) {
        let forward = Vec3::from_yaw(yaw);
        let right = -forward.perpendicular_xy();
        (self.direction.dot(forward), self.direction.dot(right))
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveDodge {
    kind: DodgeType,
    direction: Vec3,
    started: f32,
    duration: f32,
}

/// Per-bot movement controller
#[derive(Debug, Clone)]
pub struct MovementTactics {
    pub style: MovementStyle,
    pub allow_advanced: bool,
    pub debug: bool,
    dodge: Option<ActiveDodge>,
    dodge_attempts: u32,
    dodge_successes: u32,
    crouching: bool,
    sliding: bool,
    strafe_sign: f32,
    last_strafe_switch: f32,
    path: Vec<Vec3>,
    path_index: usize,
    progress_position: Vec3,
    progress_time: f32,
    stuck: bool,
}

impl MovementTactics {
    pub fn new(style: MovementStyle, skill: f32) -> Self {
        Self {
            style,
            // Advanced movement needs both the style and some skill
            allow_advanced: style == MovementStyle::Parkour || (style != MovementStyle::Standard && skill >= 0.6),
            debug: false,
            dodge: None,
            dodge_attempts: 0,
            dodge_successes: 0,
            crouching: false,
            sliding: false,
            strafe_sign: 1.0,
            last_strafe_switch: 0.0,
            path: Vec::new(),
            path_index: 0,
            progress_position: Vec3::ZERO,
            progress_time: 0.0,
            stuck: false,
        }
    }

    pub fn is_dodging(&self) -> bool {
        self.dodge.is_some()
    }

    pub fn is_crouching(&self) -> bool {
        self.crouching
    }

    pub fn is_sliding(&self) -> bool {
        self.sliding
    }

    pub fn dodge_successes(&self) -> u32 {
        self.dodge_successes
    }

    /// Completed dodges over started dodges, 0 before the first dodge
    pub fn dodge_success_rate(&self) -> f32 {
        if self.dodge_attempts == 0 {
            0.0
        } else {
            self.dodge_successes as f32 / self.dodge_attempts as f32
        }
    }

    pub fn is_stuck(&self) -> bool {
        self.stuck
    }

    // ========================================================================
    // Dodging
    // ========================================================================

    /// Pick a dodge given the unit direction from the bot toward the threat
    pub fn select_dodge_type<R: Rng + ?Sized>(&self, state: &MovementState, threat_dir: Vec3, rng: &mut R) -> DodgeType {
        if !state.on_ground {
            return DodgeType::None;
        }
        if self.style == MovementStyle::Parkour && state.speed() > SLIDE_SPEED {
            return DodgeType::Slide;
        }
        if threat_dir.z > VERTICAL_THREAT {
            return DodgeType::Duck;
        }
        if threat_dir.z < -VERTICAL_THREAT {
            return DodgeType::Jump;
        }
        if self.style == MovementStyle::Evasive {
            return if rng.gen_bool(0.5) { DodgeType::Diagonal } else { DodgeType::Sidestep };
        }
        DodgeType::Sidestep
    }

    /// Begin a dodge. Returns false when `kind` is None or a dodge is running.
    pub fn start_dodge<R: Rng + ?Sized>(
        &mut self,
        kind: DodgeType,
        state: &MovementState,
        threat_dir: Vec3,
        now: f32,
        rng: &mut R,
    ) -> bool {
        if kind == DodgeType::None || self.dodge.is_some() {
            return false;
        }
        let away = -threat_dir.flat().normalize();
        let side = away.perpendicular_xy() * if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        let direction = match kind {
            DodgeType::Sidestep | DodgeType::Jump => side,
            DodgeType::Diagonal => (side + away).normalize(),
            DodgeType::Duck => Vec3::ZERO,
            DodgeType::Slide => {
                let v = state.velocity.flat().normalize();
                if v.is_zero(1e-4) {
                    side
                } else {
                    v
                }
            }
            DodgeType::None => Vec3::ZERO,
        };
        self.crouching = matches!(kind, DodgeType::Duck | DodgeType::Slide);
        self.sliding = kind == DodgeType::Slide;
        self.dodge = Some(ActiveDodge {
            kind,
            direction,
            started: now,
            duration: kind.duration(),
        });
        self.dodge_attempts += 1;
        detail!(self.debug, ?kind, "Dodge started");
        true
    }

    /// Advance the running dodge. Returns None once no dodge is active.
    pub fn update_dodge(&mut self, now: f32) -> Option<MoveIntent> {
        let dodge = self.dodge?;
        let progress = if dodge.duration > 0.0 {
            ((now - dodge.started) / dodge.duration).clamp(0.0, 1.0)
        } else {
            1.0
        };
        if progress >= 1.0 {
            self.dodge = None;
            self.crouching = false;
            self.sliding = false;
            self.dodge_successes += 1;
            detail!(self.debug, kind = ?dodge.kind, "Dodge finished");
            return None;
        }

        // Velocity of a quadratic ease-out position curve
        let strength = (self.style.dodge_intensity() * 2.0 * (1.0 - progress)).min(1.0);
        Some(MoveIntent {
            direction: dodge.direction * strength,
            jump: dodge.kind == DodgeType::Jump && progress < 0.2,
            crouch: self.crouching,
            ..Default::default()
        })
    }

    pub fn cancel_dodge(&mut self) {
        self.dodge = None;
        self.crouching = false;
        self.sliding = false;
    }

    // ========================================================================
    // Strafing
    // ========================================================================

    /// Lateral movement while engaging a target. `to_target` points from
    /// the bot to the target.
    pub fn strafe<W: World + ?Sized, R: Rng + ?Sized>(
        &mut self,
        world: &W,
        state: &MovementState,
        to_target: Vec3,
        now: f32,
        rng: &mut R,
    ) -> MoveIntent {
        let forward = to_target.flat().normalize();
        let left = forward.perpendicular_xy();
        let direction = match self.style.strafe_pattern() {
            StrafePattern::Sinusoidal => {
                let s = (std::f32::consts::TAU * SINE_STRAFE_FREQUENCY * now).sin();
                left * s
            }
            StrafePattern::Random => {
                if now - self.last_strafe_switch >= STRAFE_MIN_DWELL && rng.gen_bool(0.5) {
                    self.strafe_sign = -self.strafe_sign;
                    self.last_strafe_switch = now;
                }
                left * self.strafe_sign
            }
            StrafePattern::Serpentine => {
                let s = (std::f32::consts::TAU * SERPENTINE_FREQUENCY * now).sin();
                (forward + left * (0.7 * s)).normalize()
            }
            StrafePattern::Predictive => left * self.predictive_side(world, state, left, now),
        };
        MoveIntent::toward(direction)
    }

    /// +1 for left, -1 for right: whichever side has more clearance
    fn predictive_side<W: World + ?Sized>(&self, world: &W, state: &MovementState, left: Vec3, now: f32) -> f32 {
        let eye = state.position + Vec3::new(0.0, 0.0, EYE_HEIGHT);
        let clearance = |dir: Vec3| {
            world
                .trace_line(eye, eye + dir * STRAFE_PROBE_DISTANCE, None, ContentMask::SOLID)
                .fraction
        };
        let l = clearance(left);
        let r = clearance(-left);
        if (l - r).abs() < STRAFE_TIE_EPSILON {
            // Alternate every half second
            if (now * 2.0) as i64 % 2 == 0 {
                1.0
            } else {
                -1.0
            }
        } else if l > r {
            1.0
        } else {
            -1.0
        }
    }

    // ========================================================================
    // Advanced techniques
    // ========================================================================

    pub fn can_strafe_jump(&self, state: &MovementState) -> bool {
        state.on_ground && state.speed() >= STRAFE_JUMP_MIN_SPEED
    }

    pub fn can_bunny_hop(&self, state: &MovementState) -> bool {
        state.on_ground && state.speed() >= BUNNY_HOP_MIN_SPEED
    }

    pub fn can_rocket_jump(&self, state: &MovementState, height_needed: f32) -> bool {
        state.on_ground
            && state.rocket_ammo > 0
            && state.health >= ROCKET_JUMP_MIN_HEALTH
            && height_needed >= ROCKET_JUMP_MIN_HEIGHT
    }

    pub fn can_wall_run<W: World + ?Sized>(&self, world: &W, state: &MovementState) -> bool {
        !state.on_ground && state.speed() >= WALL_RUN_MIN_SPEED && self.side_wall(world, state).is_some()
    }

    pub fn can_wall_jump<W: World + ?Sized>(&self, world: &W, state: &MovementState) -> bool {
        !state.on_ground && self.nearest_wall_normal(world, state).is_some()
    }

    pub fn can_air_control(&self, state: &MovementState) -> bool {
        !state.on_ground
    }

    /// Wall directly left or right of the velocity, as the wall normal
    fn side_wall<W: World + ?Sized>(&self, world: &W, state: &MovementState) -> Option<Vec3> {
        let heading = state.velocity.flat().normalize();
        let left = heading.perpendicular_xy();
        [left, -left].into_iter().find_map(|dir| {
            let tr = world.trace(
                state.position,
                PLAYER_MINS,
                PLAYER_MAXS,
                state.position + dir * WALL_PROBE_DISTANCE,
                None,
                ContentMask::SOLID,
            );
            tr.hit().then_some(tr.hit_normal)
        })
    }

    fn nearest_wall_normal<W: World + ?Sized>(&self, world: &W, state: &MovementState) -> Option<Vec3> {
        (0..8)
            .filter_map(|k| {
                let dir = Vec3::from_yaw(k as f32 * 45.0);
                let tr = world.trace(
                    state.position,
                    PLAYER_MINS,
                    PLAYER_MAXS,
                    state.position + dir * WALL_PROBE_DISTANCE,
                    None,
                    ContentMask::SOLID,
                );
                tr.hit().then_some((tr.fraction, tr.hit_normal))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, n)| n)
    }

    /// First applicable technique for moving along `goal_dir`, if the
    /// style allows advanced movement. `height_needed` is how far above the
    /// bot the destination is.
    pub fn advanced_move<W: World + ?Sized>(
        &self,
        world: &W,
        state: &MovementState,
        goal_dir: Vec3,
        height_needed: f32,
        now: f32,
    ) -> Option<(Technique, MoveIntent)> {
        if !self.allow_advanced {
            return None;
        }
        let goal = goal_dir.flat().normalize();

        if self.can_rocket_jump(state, height_needed) {
            return Some((
                Technique::RocketJump,
                MoveIntent {
                    direction: goal,
                    jump: true,
                    crouch: true,
                    fire: true,
                    pitch_override: Some(90.0),
                    ..Default::default()
                },
            ));
        }
        if self.can_wall_run(world, state) {
            if let Some(normal) = self.side_wall(world, state) {
                // Hug the wall while keeping speed
                let along = (state.velocity.flat().normalize() - normal * 0.2).normalize();
                return Some((Technique::WallRun, MoveIntent::toward(along)));
            }
        }
        if !state.on_ground && state.velocity.z < 0.0 && self.can_wall_jump(world, state) {
            if let Some(normal) = self.nearest_wall_normal(world, state) {
                let away = (normal.flat() + goal).normalize();
                return Some((
                    Technique::WallJump,
                    MoveIntent {
                        direction: away,
                        jump: true,
                        ..Default::default()
                    },
                ));
            }
        }
        if self.can_bunny_hop(state) {
            return Some((
                Technique::BunnyHop,
                MoveIntent {
                    direction: goal,
                    jump: true,
                    ..Default::default()
                },
            ));
        }
        if self.can_strafe_jump(state) {
            // Angle off the goal, alternating sides each hop
            let sign = if (now * 2.0) as i64 % 2 == 0 { 1.0 } else { -1.0 };
            let dir = goal.rotate_z(sign * 30f32.to_radians());
            return Some((
                Technique::StrafeJump,
                MoveIntent {
                    direction: dir,
                    jump: true,
                    ..Default::default()
                },
            ));
        }
        if self.can_air_control(state) {
            let blend = (state.velocity.flat().normalize() * 0.5 + goal).normalize();
            return Some((Technique::AirControl, MoveIntent::toward(blend)));
        }
        None
    }

    // ========================================================================
    // Path following
    // ========================================================================

    pub fn set_path(&mut self, waypoints: Vec<Vec3>, state: &MovementState, now: f32) {
        self.path = waypoints;
        self.path_index = 0;
        self.progress_position = state.position;
        self.progress_time = now;
        self.stuck = false;
    }

    pub fn clear_path(&mut self) {
        self.path.clear();
        self.path_index = 0;
        self.stuck = false;
    }

    pub fn current_waypoint(&self) -> Option<Vec3> {
        self.path.get(self.path_index).copied()
    }

    pub fn path_finished(&self) -> bool {
        self.path_index >= self.path.len()
    }

    /// Steer toward the current waypoint, jumping when stuck
    pub fn follow_path<W: World + ?Sized>(&mut self, world: &W, state: &MovementState, now: f32) -> Option<MoveIntent> {
        while let Some(wp) = self.current_waypoint() {
            if (wp - state.position).length_xy() > WAYPOINT_REACHED {
                break;
            }
            self.path_index += 1;
        }
        let target = self.current_waypoint()?;

        if state.position.distance_to(self.progress_position) >= STUCK_DISTANCE {
            self.progress_position = state.position;
            self.progress_time = now;
            self.stuck = false;
        } else if now - self.progress_time >= STUCK_TIME {
            self.stuck = true;
            self.progress_time = now;
            detail!(self.debug, waypoint = self.path_index, "Stuck on path");
        }

        let dir = avoid_obstacles(world, state, target - state.position);
        Some(MoveIntent {
            direction: dir,
            jump: self.stuck,
            ..Default::default()
        })
    }
}

/// Steer around whatever blocks the way ahead, trying wider angles in turn
pub fn avoid_obstacles<W: World + ?Sized>(world: &W, state: &MovementState, desired: Vec3) -> Vec3 {
    let base = desired.flat().normalize();
    if base.is_zero(1e-4) {
        return Vec3::ZERO;
    }
    let probe = |dir: Vec3| {
        let end = state.position + dir * 48.0;
        world
            .trace(state.position, PLAYER_MINS, PLAYER_MAXS, end, None, ContentMask::PLAYER_SOLID)
            .fraction
    };
    if probe(base) >= 1.0 {
        return base;
    }
    let mut best = (probe(base), base);
    for deg in [45.0f32, -45.0, 90.0, -90.0] {
        let dir = base.rotate_z(deg.to_radians());
        let f = probe(dir);
        if f >= 1.0 {
            return dir;
        }
        if f > best.0 {
            best = (f, dir);
        }
    }
    best.1
}
