//! Interfaces the AI core consumes from the game simulation.
//!
//! The engine owns collision, entities and the clock. Bots only read
//! through [`World`] and hand back one [`UserCmd`] per think.

pub mod brush;
pub mod sim;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::ai::weapons::{Inventory, Weapon};
use crate::util::vec3::Vec3;

pub use brush::BrushWorld;

/// Stable small-integer entity handle. Client entities use their slot index.
pub type EntityId = usize;

/// Player bounding box
pub const PLAYER_MINS: Vec3 = Vec3::new(-15.0, -15.0, -24.0);
pub const PLAYER_MAXS: Vec3 = Vec3::new(15.0, 15.0, 32.0);

bitflags! {
    /// Content categories a trace can collide with
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContentMask: u32 {
        const SOLID = 1;
        const LAVA = 1 << 3;
        const WATER = 1 << 5;
        const PLAYERCLIP = 1 << 16;
        const BODY = 1 << 25;
        const CORPSE = 1 << 26;

        /// Everything that stops a bullet
        const SHOT = Self::SOLID.bits() | Self::BODY.bits() | Self::CORPSE.bits();
        /// Everything that stops a walking player
        const PLAYER_SOLID = Self::SOLID.bits() | Self::PLAYERCLIP.bits() | Self::BODY.bits();
    }
}

bitflags! {
    /// Surface properties reported by a trace
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SurfaceFlags: u32 {
        const NODAMAGE = 1;
        const SLICK = 1 << 1;
        const SKY = 1 << 2;
        const LADDER = 1 << 3;
    }
}

bitflags! {
    /// Audible things an entity did recently
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct EntityEvents: u8 {
        const FIRED = 1;
        const JUMPED = 1 << 1;
        const FOOTSTEP = 1 << 2;
        const PAIN = 1 << 3;
    }
}

bitflags! {
    /// Button bitmask of a synthetic command
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Buttons: u16 {
        const ATTACK = 1;
        const GESTURE = 1 << 3;
        const WALK = 1 << 4;
        const USE = 1 << 5;
        const JUMP = 1 << 8;
        const CROUCH = 1 << 9;
    }
}

/// Result of a swept-box trace
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceResult {
    /// 1.0 means nothing was hit
    pub fraction: f32,
    pub end_position: Vec3,
    pub hit_entity: Option<EntityId>,
    pub hit_normal: Vec3,
    pub surface_flags: SurfaceFlags,
    pub start_solid: bool,
}

impl TraceResult {
    /// An unobstructed trace ending at `end`
    pub fn clear(end: Vec3) -> Self {
        Self {
            fraction: 1.0,
            end_position: end,
            hit_entity: None,
            hit_normal: Vec3::ZERO,
            surface_flags: SurfaceFlags::empty(),
            start_solid: false,
        }
    }

    #[inline]
    pub fn hit(&self) -> bool {
        self.fraction < 1.0
    }
}

/// Team membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Team {
    #[default]
    Free,
    Red,
    Blue,
    Spectator,
}

impl Team {
    /// Free-for-all players are enemies of everyone but themselves
    pub fn is_enemy_of(self, other: Team) -> bool {
        match (self, other) {
            (Team::Spectator, _) | (_, Team::Spectator) => false,
            (Team::Free, _) | (_, Team::Free) => true,
            (a, b) => a != b,
        }
    }

    pub fn opponent(self) -> Option<Team> {
        match self {
            Team::Red => Some(Team::Blue),
            Team::Blue => Some(Team::Red),
            _ => None,
        }
    }
}

/// What an entity is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntityKind {
    Player,
    Health,
    Armor,
    WeaponPickup(Weapon),
    Ammo(Weapon),
    Powerup,
    Projectile(Weapon),
    #[default]
    Other,
}

impl EntityKind {
    pub fn is_item(self) -> bool {
        matches!(
            self,
            EntityKind::Health | EntityKind::Armor | EntityKind::WeaponPickup(_) | EntityKind::Ammo(_) | EntityKind::Powerup
        )
    }
}

/// Read-only entity view shared by the simulation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityState {
    pub id: EntityId,
    pub kind: EntityKind,
    pub in_use: bool,
    pub position: Vec3,
    pub velocity: Vec3,
    /// Pitch, yaw, roll in degrees
    pub angles: Vec3,
    pub health: i32,
    pub armor: i32,
    pub weapon: Weapon,
    pub inventory: Inventory,
    pub team: Team,
    pub on_ground: bool,
    pub crouching: bool,
    pub events: EntityEvents,
    /// World time of the most recent event in `events`
    pub event_time: f32,
    /// Shooter of a projectile
    pub owner: Option<EntityId>,
}

impl EntityState {
    pub fn player(id: EntityId, position: Vec3, team: Team) -> Self {
        Self {
            id,
            kind: EntityKind::Player,
            in_use: true,
            position,
            health: 100,
            inventory: Inventory::spawn_loadout(),
            weapon: Weapon::Machinegun,
            team,
            on_ground: true,
            ..Default::default()
        }
    }

    pub fn item(id: EntityId, kind: EntityKind, position: Vec3) -> Self {
        Self {
            id,
            kind,
            in_use: true,
            position,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_alive_player(&self) -> bool {
        self.in_use && self.kind == EntityKind::Player && self.health > 0
    }

    #[inline]
    pub fn eye(&self) -> Vec3 {
        self.position + Vec3::new(0.0, 0.0, crate::ai::constants::perception::EYE_HEIGHT)
    }

    /// Unit view direction from the entity's angles
    pub fn view_dir(&self) -> Vec3 {
        Vec3::from_angles(self.angles.x, self.angles.y)
    }
}

/// Everything the AI core needs from the running game
pub trait World {
    /// Current simulation time in seconds
    fn time(&self) -> f32;

    /// Sweep a box from `start` to `end`
    fn trace(
        &self,
        start: Vec3,
        mins: Vec3,
        maxs: Vec3,
        end: Vec3,
        ignore: Option<EntityId>,
        mask: ContentMask,
    ) -> TraceResult;

    /// Entity array indexed by id
    fn entities(&self) -> &[EntityState];

    /// Playable bounds (mins, maxs)
    fn bounds(&self) -> (Vec3, Vec3);

    fn entity(&self, id: EntityId) -> Option<&EntityState> {
        self.entities().get(id).filter(|e| e.in_use)
    }

    /// Point trace shorthand
    fn trace_line(&self, start: Vec3, end: Vec3, ignore: Option<EntityId>, mask: ContentMask) -> TraceResult {
        self.trace(start, Vec3::ZERO, Vec3::ZERO, end, ignore, mask)
    }

    /// Ids of in-use entities whose origin lies inside the box
    fn entities_in_box(&self, mins: Vec3, maxs: Vec3) -> Vec<EntityId> {
        self.entities()
            .iter()
            .filter(|e| {
                e.in_use
                    && e.position.x >= mins.x
                    && e.position.x <= maxs.x
                    && e.position.y >= mins.y
                    && e.position.y <= maxs.y
                    && e.position.z >= mins.z
                    && e.position.z <= maxs.z
            })
            .map(|e| e.id)
            .collect()
    }
}

/// One synthetic input frame, consumed verbatim by the client-command layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UserCmd {
    /// Milliseconds of world time this command was produced for
    pub server_time: i32,
    /// Pitch, yaw, roll in degrees
    pub angles: Vec3,
    pub forward_move: i8,
    pub right_move: i8,
    pub up_move: i8,
    pub buttons: Buttons,
    pub weapon: Weapon,
}

impl UserCmd {
    /// Convert normalized (-1..1) movement into clamped command magnitudes
    pub fn set_movement(&mut self, forward: f32, right: f32, up: f32) {
        self.forward_move = to_move(forward);
        self.right_move = to_move(right);
        self.up_move = to_move(up);
    }
}

fn to_move(value: f32) -> i8 {
    let max = crate::ai::constants::bot::MOVE_MAX;
    let scaled = (value * max as f32).round() as i32;
    scaled.clamp(-max, max) as i8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_relations() {
        assert!(Team::Red.is_enemy_of(Team::Blue));
        assert!(!Team::Red.is_enemy_of(Team::Red));
        assert!(Team::Free.is_enemy_of(Team::Free));
        assert!(!Team::Spectator.is_enemy_of(Team::Red));
        assert_eq!(Team::Red.opponent(), Some(Team::Blue));
    }

    #[test]
    fn test_movement_clamped() {
        let mut cmd = UserCmd::default();
        cmd.set_movement(2.0, -5.0, 0.5);
        assert_eq!(cmd.forward_move, 127);
        assert_eq!(cmd.right_move, -127);
        assert_eq!(cmd.up_move, 64);
    }

    #[test]
    fn test_content_mask_composites() {
        assert!(ContentMask::SHOT.contains(ContentMask::BODY));
        assert!(!ContentMask::SHOT.contains(ContentMask::PLAYERCLIP));
        assert!(ContentMask::PLAYER_SOLID.contains(ContentMask::SOLID));
    }
}
