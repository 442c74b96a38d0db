//! Minimal arena simulation driving bots in the headless runner and tests.
//!
//! Not a physics reproduction: players run at a fixed speed, slide along
//! walls with one clip pass, and every weapon resolves as an instant trace.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ai::constants::movement::RUN_SPEED;
use crate::ai::manager::BotEvent;
use crate::ai::weapons::Weapon;
use crate::util::vec3::Vec3;
use crate::world::{
    Buttons, ContentMask, EntityEvents, EntityId, EntityKind, EntityState, Team, World,
    BrushWorld, UserCmd, PLAYER_MAXS, PLAYER_MINS,
};

const GRAVITY: f32 = 800.0;
const JUMP_VELOCITY: f32 = 270.0;
const RESPAWN_DELAY: f32 = 1.5;
const ITEM_RESPAWN_DELAY: f32 = 20.0;
const PICKUP_RADIUS: f32 = 40.0;
const GROUND_PROBE: f32 = 2.0;

/// Seconds between shots
fn refire_time(weapon: Weapon) -> f32 {
    match weapon {
        Weapon::Gauntlet => 0.4,
        Weapon::Machinegun => 0.1,
        Weapon::Shotgun => 1.0,
        Weapon::GrenadeLauncher => 0.8,
        Weapon::RocketLauncher => 0.8,
        Weapon::LightningGun => 0.05,
        Weapon::Railgun => 1.5,
        Weapon::PlasmaGun => 0.1,
        Weapon::Bfg => 0.2,
    }
}

/// Arena state around a [`BrushWorld`]
pub struct ArenaSim {
    pub world: BrushWorld,
    spawn_points: Vec<Vec3>,
    next_fire: Vec<f32>,
    respawn_at: Vec<Option<f32>>,
    rng: StdRng,
}

impl ArenaSim {
    pub fn new(world: BrushWorld, spawn_points: Vec<Vec3>, seed: u64) -> Self {
        Self {
            world,
            spawn_points,
            next_fire: Vec::new(),
            respawn_at: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Demo map: a square room with pillars, low walls and a few pickups
    pub fn demo(seed: u64) -> Self {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        // Pillars
        for (x, y) in [(-384.0, -384.0), (384.0, -384.0), (-384.0, 384.0), (384.0, 384.0)] {
            world.add_box(Vec3::new(x - 32.0, y - 32.0, 0.0), Vec3::new(x + 32.0, y + 32.0, 192.0));
        }
        // Low walls crossing the middle lanes
        world.add_box(Vec3::new(-160.0, -16.0, 0.0), Vec3::new(160.0, 16.0, 40.0));
        world.add_box(Vec3::new(-16.0, 480.0, 0.0), Vec3::new(16.0, 736.0, 40.0));
        world.add_box(Vec3::new(-16.0, -736.0, 0.0), Vec3::new(16.0, -480.0, 40.0));

        let z = -PLAYER_MINS.z;
        let spawns = vec![
            Vec3::new(-800.0, -800.0, z),
            Vec3::new(800.0, 800.0, z),
            Vec3::new(-800.0, 800.0, z),
            Vec3::new(800.0, -800.0, z),
            Vec3::new(0.0, -880.0, z),
            Vec3::new(0.0, 880.0, z),
            Vec3::new(-880.0, 0.0, z),
            Vec3::new(880.0, 0.0, z),
        ];

        let mut sim = Self::new(world, spawns, seed);
        let items = [
            (EntityKind::Health, Vec3::new(0.0, 256.0, 8.0)),
            (EntityKind::Health, Vec3::new(0.0, -256.0, 8.0)),
            (EntityKind::Armor, Vec3::new(600.0, 0.0, 8.0)),
            (EntityKind::WeaponPickup(Weapon::Shotgun), Vec3::new(-600.0, 0.0, 8.0)),
            (EntityKind::WeaponPickup(Weapon::Railgun), Vec3::new(0.0, 600.0, 8.0)),
            (EntityKind::WeaponPickup(Weapon::RocketLauncher), Vec3::new(0.0, -600.0, 8.0)),
        ];
        // Reserve the low ids for clients so bots map onto their slot index
        for (i, (kind, pos)) in items.into_iter().enumerate() {
            sim.world.insert_at(crate::ai::constants::bot::MAX_CLIENTS + i, EntityState::item(0, kind, pos));
        }
        sim
    }

    fn ensure_slot(&mut self, id: EntityId) {
        if self.next_fire.len() <= id {
            self.next_fire.resize(id + 1, 0.0);
            self.respawn_at.resize(id + 1, None);
        }
    }

    /// Place a fresh player for a client at a random spawn point
    pub fn spawn_player(&mut self, id: EntityId, team: Team) -> Vec3 {
        self.ensure_slot(id);
        let position = self.pick_spawn();
        let mut player = EntityState::player(id, position, team);
        player.angles.y = self.rng.gen_range(-180.0..180.0);
        self.world.insert_at(id, player);
        self.respawn_at[id] = None;
        position
    }

    fn pick_spawn(&mut self) -> Vec3 {
        if self.spawn_points.is_empty() {
            return Vec3::new(0.0, 0.0, -PLAYER_MINS.z);
        }
        let occupied: Vec<Vec3> = self
            .world
            .entities()
            .iter()
            .filter(|e| e.is_alive_player())
            .map(|e| e.position)
            .collect();
        // Farthest spawn from everyone alive, ties broken randomly
        let offset = self.rng.gen_range(0..self.spawn_points.len());
        let mut best = self.spawn_points[offset];
        let mut best_dist = -1.0;
        for i in 0..self.spawn_points.len() {
            let p = self.spawn_points[(offset + i) % self.spawn_points.len()];
            let d = occupied
                .iter()
                .map(|o| o.distance_sq_to(p))
                .fold(f32::INFINITY, f32::min);
            if d > best_dist {
                best_dist = d;
                best = p;
            }
        }
        best
    }

    /// Apply one bot command for `dt` seconds and return the resulting events
    pub fn apply_command(&mut self, id: EntityId, cmd: &UserCmd, dt: f32) -> Vec<BotEvent> {
        let mut events = Vec::new();
        let now = self.world.time();
        let Some(player) = self.world.entities().get(id).filter(|e| e.is_alive_player()).cloned() else {
            return events;
        };

        self.move_player(id, &player, cmd, dt);

        if cmd.buttons.contains(Buttons::ATTACK) {
            self.ensure_slot(id);
            let weapon = if player.inventory.usable(cmd.weapon) { cmd.weapon } else { player.weapon };
            if now >= self.next_fire[id] && player.inventory.usable(weapon) {
                self.next_fire[id] = now + refire_time(weapon);
                events.extend(self.fire(id, weapon, cmd.angles, now));
            }
        } else if let Some(e) = self.world.entity_mut(id) {
            if e.inventory.usable(cmd.weapon) {
                e.weapon = cmd.weapon;
            }
        }
        events
    }

    fn move_player(&mut self, id: EntityId, player: &EntityState, cmd: &UserCmd, dt: f32) {
        let forward = Vec3::from_yaw(cmd.angles.y);
        let right = -forward.perpendicular_xy();
        let scale = if cmd.buttons.contains(Buttons::WALK) { 0.5 } else { 1.0 };
        let wish = (forward * cmd.forward_move as f32 + right * cmd.right_move as f32) * (1.0 / 127.0);
        let wish = wish.clamp_length(1.0) * (RUN_SPEED * scale);

        let mut velocity = Vec3::new(wish.x, wish.y, player.velocity.z);
        if player.on_ground && (cmd.buttons.contains(Buttons::JUMP) || cmd.up_move > 0) {
            velocity.z = JUMP_VELOCITY;
        }
        if !player.on_ground || velocity.z > 0.0 {
            velocity.z -= GRAVITY * dt;
        }

        let mut position = player.position;
        let mut delta = velocity * dt;
        for _ in 0..2 {
            let tr = self.world.trace(position, PLAYER_MINS, PLAYER_MAXS, position + delta, Some(id), ContentMask::PLAYER_SOLID);
            if tr.start_solid {
                break;
            }
            position = tr.end_position;
            if !tr.hit() {
                break;
            }
            // Clip the remaining motion against the hit plane
            let remaining = delta * (1.0 - tr.fraction);
            delta = remaining - tr.hit_normal * remaining.dot(tr.hit_normal);
            velocity -= tr.hit_normal * velocity.dot(tr.hit_normal);
        }

        let ground = self.world.trace(
            position,
            PLAYER_MINS,
            PLAYER_MAXS,
            position - Vec3::new(0.0, 0.0, GROUND_PROBE),
            Some(id),
            ContentMask::PLAYER_SOLID,
        );
        let on_ground = ground.hit() && ground.hit_normal.z > 0.7 && velocity.z <= 0.0;
        if on_ground {
            velocity.z = 0.0;
        }

        let now = self.world.time();
        if let Some(e) = self.world.entity_mut(id) {
            let was_on_ground = e.on_ground;
            e.position = position;
            e.velocity = velocity;
            e.angles = cmd.angles;
            e.crouching = cmd.buttons.contains(Buttons::CROUCH);
            let event = if was_on_ground && velocity.z > 0.0 {
                Some(EntityEvents::JUMPED)
            } else if on_ground && (!was_on_ground || velocity.length_xy() > RUN_SPEED * 0.75) {
                Some(EntityEvents::FOOTSTEP)
            } else {
                None
            };
            if let Some(event) = event {
                e.events.insert(event);
                e.event_time = now;
            }
            e.on_ground = on_ground;
        }
    }

    fn fire(&mut self, shooter: EntityId, weapon: Weapon, angles: Vec3, now: f32) -> Vec<BotEvent> {
        let mut events = Vec::new();
        let Some(attacker) = self.world.entity(shooter).cloned() else {
            return events;
        };

        if let Some(e) = self.world.entity_mut(shooter) {
            e.weapon = weapon;
            if weapon != Weapon::Gauntlet {
                e.inventory.ammo[weapon.index()] -= 1;
            }
            e.events.insert(EntityEvents::FIRED);
            e.event_time = now;
        }

        let stats = weapon.stats();
        let eye = attacker.eye();
        let end = eye + Vec3::from_angles(angles.x, angles.y) * stats.max_range;
        let tr = self.world.trace_line(eye, end, Some(shooter), ContentMask::SHOT);

        let victim = tr.hit_entity.and_then(|v| self.world.entity(v).cloned()).filter(|v| {
            v.is_alive_player() && (v.team.is_enemy_of(attacker.team) || v.team == Team::Free)
        });
        events.push(BotEvent::ShotFired { shooter, hit: victim.is_some() });

        if let Some(victim) = victim {
            let damage = (stats.dps * refire_time(weapon)).round() as i32;
            events.extend(self.damage(Some(shooter), victim.id, damage, now));
        }
        events
    }

    /// Apply damage with armor absorbing two thirds, returning damage/kill events
    pub fn damage(&mut self, attacker: Option<EntityId>, victim: EntityId, amount: i32, now: f32) -> Vec<BotEvent> {
        let mut events = Vec::new();
        self.ensure_slot(victim);
        let Some(v) = self.world.entity_mut(victim) else {
            return events;
        };
        if !v.is_alive_player() || amount <= 0 {
            return events;
        }
        let absorbed = (amount * 2 / 3).min(v.armor);
        v.armor -= absorbed;
        let taken = amount - absorbed;
        v.health -= taken;
        v.events.insert(EntityEvents::PAIN);
        v.event_time = now;
        events.push(BotEvent::Damage { attacker, victim, amount: taken });

        if v.health <= 0 {
            v.health = 0;
            v.velocity = Vec3::ZERO;
            self.respawn_at[victim] = Some(now + RESPAWN_DELAY);
            events.push(BotEvent::Kill { killer: attacker, victim });
        }
        events
    }

    /// Advance the clock, respawn dead players and handle item pickups
    pub fn step(&mut self, dt: f32) {
        self.world.advance(dt);
        let now = self.world.time();

        let due: Vec<(EntityId, Team)> = self
            .respawn_at
            .iter()
            .enumerate()
            .filter_map(|(id, at)| match at {
                Some(t) if *t <= now => self.world.entities().get(id).filter(|e| e.in_use).map(|e| (id, e.team)),
                _ => None,
            })
            .collect();
        for (id, team) in due {
            self.spawn_player(id, team);
        }

        // Clear stale events so hearing only picks up fresh activity
        for e in self.world.entities_mut() {
            if !e.events.is_empty() && now - e.event_time > 0.5 {
                e.events = EntityEvents::empty();
            }
        }

        self.pickup_items(now);
    }

    fn pickup_items(&mut self, now: f32) {
        let entities = self.world.entities_mut();
        let (players, items): (Vec<usize>, Vec<usize>) = (0..entities.len())
            .filter(|&i| entities[i].is_alive_player() || entities[i].kind.is_item())
            .partition(|&i| entities[i].kind == EntityKind::Player);

        for item_id in items {
            let item = &entities[item_id];
            if !item.in_use {
                // Items reuse event_time as their respawn timestamp
                if item.event_time > 0.0 && now >= item.event_time {
                    entities[item_id].in_use = true;
                    entities[item_id].event_time = 0.0;
                }
                continue;
            }
            let item_pos = item.position;
            let kind = item.kind;
            let Some(&taker) = players
                .iter()
                .find(|&&p| entities[p].position.flat().distance_to(item_pos.flat()) < PICKUP_RADIUS)
            else {
                continue;
            };
            let p = &mut entities[taker];
            match kind {
                EntityKind::Health => p.health = (p.health + 25).min(100),
                EntityKind::Armor => p.armor = (p.armor + 50).min(100),
                EntityKind::WeaponPickup(w) => p.inventory.give(w, 10),
                EntityKind::Ammo(w) => p.inventory.ammo[w.index()] += 10,
                _ => {}
            }
            entities[item_id].in_use = false;
            entities[item_id].event_time = now + ITEM_RESPAWN_DELAY;
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_with_two() -> ArenaSim {
        let world = BrushWorld::arena(1024.0, 256.0);
        let z = -PLAYER_MINS.z;
        let mut sim = ArenaSim::new(world, vec![Vec3::new(0.0, 0.0, z)], 1);
        sim.spawn_player(0, Team::Red);
        sim.spawn_player(1, Team::Blue);
        if let Some(e) = sim.world.entity_mut(0) {
            e.position = Vec3::new(0.0, 0.0, z);
        }
        if let Some(e) = sim.world.entity_mut(1) {
            e.position = Vec3::new(400.0, 0.0, z);
        }
        sim
    }

    #[test]
    fn test_forward_move_advances() {
        let mut sim = sim_with_two();
        let mut cmd = UserCmd::default();
        cmd.set_movement(1.0, 0.0, 0.0);
        cmd.angles = Vec3::new(0.0, 90.0, 0.0);
        sim.apply_command(0, &cmd, 0.1);
        let p = sim.world.entity(0).unwrap();
        assert!((p.position.y - RUN_SPEED * 0.1).abs() < 1.0);
        assert!(p.on_ground);
    }

    #[test]
    fn test_wall_stops_movement() {
        let mut sim = sim_with_two();
        let mut cmd = UserCmd::default();
        cmd.set_movement(1.0, 0.0, 0.0);
        cmd.angles = Vec3::new(0.0, 180.0, 0.0);
        for _ in 0..100 {
            sim.apply_command(0, &cmd, 0.05);
        }
        let p = sim.world.entity(0).unwrap();
        assert!(p.position.x > -1024.0 + 14.0);
    }

    #[test]
    fn test_hitscan_damage_and_kill() {
        let mut sim = sim_with_two();
        let mut cmd = UserCmd::default();
        cmd.weapon = Weapon::Machinegun;
        cmd.buttons = Buttons::ATTACK;
        cmd.angles = Vec3::ZERO;

        let events = sim.apply_command(0, &cmd, 0.05);
        assert!(events.iter().any(|e| matches!(e, BotEvent::ShotFired { hit: true, .. })));
        assert!(events.iter().any(|e| matches!(e, BotEvent::Damage { victim: 1, .. })));
        assert!(sim.world.entity(1).unwrap().health < 100);

        let kill = sim.damage(Some(0), 1, 500, 1.0);
        assert!(kill.iter().any(|e| matches!(e, BotEvent::Kill { victim: 1, .. })));
        assert!(!sim.world.entity(1).unwrap().is_alive_player());
    }

    #[test]
    fn test_respawn_after_delay() {
        let mut sim = sim_with_two();
        sim.damage(Some(0), 1, 500, 0.0);
        sim.step(RESPAWN_DELAY + 0.1);
        assert!(sim.world.entity(1).unwrap().is_alive_player());
    }

    #[test]
    fn test_armor_absorbs() {
        let mut sim = sim_with_two();
        sim.world.entity_mut(1).unwrap().armor = 100;
        sim.damage(Some(0), 1, 30, 0.0);
        let v = sim.world.entity(1).unwrap();
        assert_eq!(v.armor, 80);
        assert_eq!(v.health, 90);
    }
}
