//! Tuning constants for the bot AI core.
//!
//! Grouped per subsystem. Distances are world units, times are seconds
//! unless a name says otherwise.

/// Bot orchestration constants
pub mod bot {
    /// Maximum number of client slots
    pub const MAX_CLIENTS: usize = 64;
    /// Default interval between think cycles (seconds)
    pub const DEFAULT_THINK_TIME: f32 = 0.05;
    /// Synthetic movement magnitudes are clamped to this range
    pub const MOVE_MAX: i32 = 127;
    /// Time spent in Spawning before the first real decision
    pub const SPAWN_SETTLE_TIME: f32 = 0.5;
    /// Max turn rate at full reaction skill (degrees per second)
    pub const MAX_TURN_RATE: f32 = 720.0;
    /// Min turn rate at zero reaction skill (degrees per second)
    pub const MIN_TURN_RATE: f32 = 180.0;
    /// Aim error under which the bot pulls the trigger (degrees)
    pub const FIRE_ANGLE_TOLERANCE: f32 = 8.0;
    /// Visited positions remembered for exploration
    pub const VISITED_CAPACITY: usize = 32;
    /// Damage history entries kept per bot
    pub const DAMAGE_HISTORY_CAPACITY: usize = 16;
    /// Enemies tracked in long-term memory
    pub const ENEMY_MEMORY_CAPACITY: usize = 16;
    /// Items remembered
    pub const ITEM_MEMORY_CAPACITY: usize = 32;
    /// Minimum distance between two recorded visited positions
    pub const VISITED_SPACING: f32 = 128.0;
    /// Health at or under which item goals become urgent
    pub const NEEDS_HEALTH: i32 = 50;
}

/// Perception constants
pub mod perception {
    /// Visible entity cap; extra entities are dropped in scan order
    pub const MAX_VISIBLE_ENTITIES: usize = 32;
    /// Remembered entity cap; the stalest entry is evicted first
    pub const MAX_MEMORY_ENTRIES: usize = 64;
    /// Recent sounds retained
    pub const MAX_SOUNDS: usize = 16;
    /// Seconds between vision rescans
    pub const VISION_UPDATE_INTERVAL: f32 = 0.1;
    /// Seconds between hearing updates
    pub const HEARING_UPDATE_INTERVAL: f32 = 0.2;
    pub const DEFAULT_VISION_RANGE: f32 = 2000.0;
    pub const DEFAULT_FOV_DEGREES: f32 = 90.0;
    /// Full peripheral cone; entities between fov and this are admitted probabilistically
    pub const DEFAULT_PERIPHERAL_DEGREES: f32 = 160.0;
    pub const DEFAULT_PERIPHERAL_SENSITIVITY: f32 = 0.5;
    /// Per-second confidence multiplier for unobserved memory
    pub const DEFAULT_DECAY_RATE: f32 = 0.8;
    pub const MEMORY_MIN_CONFIDENCE: f32 = 0.1;
    pub const MEMORY_MAX_AGE: f32 = 10.0;
    /// Line of sight requires at least this trace fraction
    pub const LOS_MIN_FRACTION: f32 = 0.95;
    /// Eye height above entity origin
    pub const EYE_HEIGHT: f32 = 26.0;
    pub const DEFAULT_HEARING_RANGE: f32 = 1500.0;
    /// Events older than this are not heard
    pub const SOUND_EVENT_WINDOW: f32 = 0.5;
    /// Sounds quieter than this are discarded
    pub const MIN_SOUND_VOLUME: f32 = 0.05;
    /// Volume multiplier when the path to the source is blocked
    pub const OCCLUSION_FACTOR: f32 = 0.5;
    /// Minimum angular separation for the flanked flag (~108 degrees)
    pub const FLANK_SEPARATION: f32 = 1.885;
    /// More simultaneous threats than this means outnumbered
    pub const OUTNUMBERED_THREATS: usize = 2;
    /// Health loss within this window counts as under fire
    pub const UNDER_FIRE_WINDOW: f32 = 1.0;
    /// Length of spatial awareness probes
    pub const SPATIAL_PROBE_DISTANCE: f32 = 256.0;
    /// Open-space ratio under which the bot is boxed in
    pub const BOXED_IN_RATIO: f32 = 0.3;
    /// Height advantage over the threat center that counts as high ground
    pub const HIGH_GROUND_DELTA: f32 = 64.0;
    /// Reference speed for the motion visibility bonus
    pub const MOTION_REFERENCE_SPEED: f32 = 320.0;
}

/// Threat scoring constants
pub mod threat {
    pub const DISTANCE_WEIGHT: f32 = 30.0;
    pub const WEAPON_WEIGHT: f32 = 25.0;
    pub const HEALTH_WEIGHT: f32 = 20.0;
    pub const VISIBILITY_BONUS: f32 = 15.0;
    pub const CAN_HIT_ME_BONUS: f32 = 20.0;
    pub const CAN_I_HIT_BONUS: f32 = 10.0;
    /// Prior damage bonus per point of damage received
    pub const PRIOR_DAMAGE_SCALE: f32 = 0.2;
    pub const PRIOR_DAMAGE_CAP: f32 = 15.0;
    /// Window over which received damage contributes
    pub const PRIOR_DAMAGE_WINDOW: f32 = 5.0;
    pub const MEDIUM_THRESHOLD: f32 = 20.0;
    pub const HIGH_THRESHOLD: f32 = 40.0;
    pub const CRITICAL_THRESHOLD: f32 = 60.0;
    /// Half-angle of the cone an enemy must face us within to "hit me"
    pub const FACING_HALF_ANGLE: f32 = 0.52;
}

/// Tactical combat constants
pub mod combat {
    pub const MAX_THREATS: usize = 8;
    pub const FEATURE_COUNT: usize = 15;
    pub const OUTPUT_COUNT: usize = 5;
    pub const LOW_HEALTH: i32 = 30;
    pub const LOW_AMMO: i32 = 5;
    /// Memory younger than this keeps the bot Searching
    pub const SEARCH_MEMORY_TIME: f32 = 5.0;
    /// Guerrilla bots break off after this long in combat
    pub const GUERRILLA_ENGAGE_TIME: f32 = 3.0;
    /// Gravity used for projectile drop compensation
    pub const GRAVITY: f32 = 800.0;
    /// Spread scale at zero accuracy, as a fraction of distance
    pub const AIM_SPREAD_SCALE: f32 = 0.05;
    pub const DECISION_THRESHOLD: f32 = 0.5;
    /// Initial bias on the boolean outputs, keeps an untrained net conservative
    pub const FLAG_OUTPUT_BIAS: f32 = -2.0;
    /// Hold-fire gap between bursts
    pub const BURST_PAUSE: f32 = 0.25;
}

/// Movement constants
pub mod movement {
    pub const SIDESTEP_DURATION: f32 = 0.3;
    pub const DIAGONAL_DURATION: f32 = 0.4;
    pub const JUMP_DODGE_DURATION: f32 = 0.5;
    pub const DUCK_DURATION: f32 = 0.6;
    pub const SLIDE_DURATION: f32 = 0.8;
    /// Speed over which parkour bots slide instead of sidestepping
    pub const SLIDE_SPEED: f32 = 320.0;
    /// Vertical component of the threat direction that triggers duck/jump
    pub const VERTICAL_THREAT: f32 = 0.5;
    /// Minimum time a random strafe direction persists
    pub const STRAFE_MIN_DWELL: f32 = 0.4;
    pub const SINE_STRAFE_FREQUENCY: f32 = 1.5;
    pub const SERPENTINE_FREQUENCY: f32 = 0.5;
    pub const STRAFE_PROBE_DISTANCE: f32 = 96.0;
    /// Clearance difference under which strafe sides count as equal
    pub const STRAFE_TIE_EPSILON: f32 = 0.05;
    pub const STRAFE_JUMP_MIN_SPEED: f32 = 200.0;
    pub const BUNNY_HOP_MIN_SPEED: f32 = 280.0;
    pub const WALL_RUN_MIN_SPEED: f32 = 250.0;
    pub const WALL_PROBE_DISTANCE: f32 = 32.0;
    pub const ROCKET_JUMP_MIN_HEALTH: i32 = 60;
    pub const ROCKET_JUMP_MIN_HEIGHT: f32 = 64.0;
    pub const WAYPOINT_REACHED: f32 = 32.0;
    /// Distance under which the bot is considered stuck over STUCK_TIME
    pub const STUCK_DISTANCE: f32 = 8.0;
    pub const STUCK_TIME: f32 = 1.0;
    pub const RUN_SPEED: f32 = 320.0;
}

/// Cover system constants
pub mod cover {
    pub const MAX_COVER_POINTS: usize = 4096;
    pub const DEFAULT_GRID_SPACING: f32 = 64.0;
    pub const STEP_HEIGHT: f32 = 18.0;
    pub const MIN_GROUND_NORMAL: f32 = 0.7;
    /// Length of the probe traces used to validate a cover point
    pub const PROBE_DISTANCE: f32 = 64.0;
    /// Probe heights above the ground point (crouch, waist, head)
    pub const PROBE_HEIGHTS: [f32; 3] = [16.0, 36.0, 56.0];
    pub const OVERHEAD_PROBE: f32 = 128.0;
    pub const PEEK_OFFSET: f32 = 32.0;
    pub const MAX_CONNECTIONS: usize = 4;
    pub const CONNECT_RADIUS: f32 = 512.0;
    pub const CONNECT_CLEAR_RATIO: f32 = 0.9;
    pub const OPTIMAL_THREAT_DISTANCE: f32 = 400.0;
    pub const RECENT_USE_TIME: f32 = 10.0;
    pub const RECENT_USE_PENALTY: f32 = 0.3;
    pub const HASH_CELL_SIZE: f32 = 256.0;
    /// Samples along the approach path for exposure scoring
    pub const APPROACH_SAMPLES: usize = 5;
}

/// Skill adaptation constants
pub mod skill {
    pub const ADJUST_INTERVAL: f32 = 30.0;
    /// Intentionally under 50% so the balance favors the human side
    pub const TARGET_WIN_RATE: f32 = 0.45;
    pub const HISTORY_WINDOW: usize = 50;
    pub const DEFAULT_LEARNING_RATE: f32 = 0.1;
    pub const DEFAULT_MOMENTUM: f32 = 0.7;
    pub const DEFAULT_MIN_SKILL: f32 = 0.1;
    pub const DEFAULT_MAX_SKILL: f32 = 1.0;
    /// Maximum change of the visible skill per second
    pub const INTERPOLATION_RATE: f32 = 0.02;
    pub const REACTION_RATE: f32 = 1.2;
    pub const AIM_RATE: f32 = 1.0;
    pub const PREDICTION_RATE: f32 = 0.9;
    pub const MOVEMENT_RATE: f32 = 0.8;
    pub const TACTICAL_RATE: f32 = 0.6;
    pub const RESOURCE_RATE: f32 = 0.5;
    pub const TEAMWORK_RATE: f32 = 0.4;
}

/// Strategic planning constants
pub mod strategy {
    pub const STRATEGY_COUNT: usize = 8;
    pub const SITUATION_FEATURES: usize = 19;
    pub const PLAN_MAX_AGE: f32 = 30.0;
    pub const MIN_EFFECTIVENESS: f32 = 0.3;
    pub const MIN_EXECUTION_TIME: f32 = 5.0;
    pub const OBJECTIVE_DEADLINE: f32 = 20.0;
    pub const OBJECTIVE_RADIUS: f32 = 192.0;
    /// Remaining match time under which a winning team turtles
    pub const ENDGAME_TIME: f32 = 60.0;
    pub const MOMENTUM_OVERRIDE: f32 = -0.5;
    pub const MAX_GOALS: usize = 2;
    pub const MAX_REGION_OBJECTIVES: usize = 4;
}

/// Team coordination constants
pub mod team {
    pub const COORDINATION_INTERVAL: f32 = 0.5;
    pub const MESSAGES_PER_UPDATE: usize = 5;
    pub const MESSAGE_QUEUE_CAPACITY: usize = 32;
    pub const MAX_SQUADS: usize = 4;
    pub const MAX_SQUAD_SIZE: usize = 5;
    pub const MAX_ATTACKERS: usize = 3;
    pub const FORMATION_SPACING: f32 = 96.0;
    pub const CROSSFIRE_RADIUS: f32 = 400.0;
    pub const FLANK_DISTANCE: f32 = 384.0;
    pub const SUPPRESSION_OFFSET: f32 = 128.0;
    pub const COVER_BEHIND_OFFSET: f32 = 96.0;
    pub const LOW_EFFECTIVENESS: f32 = 0.3;
    pub const HIGH_EFFECTIVENESS: f32 = 0.7;
    /// Weight given to the team's average velocity when moving in formation
    pub const VELOCITY_MATCH_WEIGHT: f32 = 0.3;
}

/// Neural network constants
pub mod neural {
    pub const DEFAULT_LEARNING_RATE: f32 = 0.001;
    pub const DEFAULT_MOMENTUM: f32 = 0.9;
    pub const WEIGHT_DECAY: f32 = 1e-4;
    pub const GRADIENT_CLIP: f32 = 5.0;
    pub const BATCH_NORM_MOMENTUM: f32 = 0.9;
    pub const BATCH_NORM_EPSILON: f32 = 1e-5;
    pub const LEAKY_SLOPE: f32 = 0.01;
    pub const CHECKPOINT_MAGIC: [u8; 4] = *b"BNN1";
}

/// PPO learning constants
pub mod ppo {
    pub const UPDATE_FREQUENCY: usize = 2048;
    pub const TRAJECTORY_CAPACITY: usize = 2048;
    pub const REPLAY_CAPACITY: usize = 16384;
    pub const EPOCHS: usize = 4;
    pub const BATCH_SIZE: usize = 64;
    pub const GAMMA: f32 = 0.99;
    pub const LAMBDA: f32 = 0.95;
    pub const CLIP_EPSILON: f32 = 0.2;
    pub const VALUE_COEFFICIENT: f32 = 0.5;
    pub const ENTROPY_COEFFICIENT: f32 = 0.01;
    pub const TARGET_UPDATE_INTERVAL: u64 = 100;
    pub const TARGET_TAU: f32 = 0.1;
    pub const ACTOR_LEARNING_RATE: f32 = 3e-4;
    pub const CRITIC_LEARNING_RATE: f32 = 1e-3;
}
