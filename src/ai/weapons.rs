//! Arena weapon table and bot-side inventory view.

use serde::{Deserialize, Serialize};

/// Weapons a bot can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Weapon {
    #[default]
    Gauntlet = 0,
    Machinegun = 1,
    Shotgun = 2,
    GrenadeLauncher = 3,
    RocketLauncher = 4,
    LightningGun = 5,
    Railgun = 6,
    PlasmaGun = 7,
    Bfg = 8,
}

pub const WEAPON_COUNT: usize = 9;

/// Static characteristics used for selection, threat rating and aim lead
#[derive(Debug, Clone, Copy)]
pub struct WeaponStats {
    pub name: &'static str,
    pub min_range: f32,
    pub optimal_range: f32,
    pub max_range: f32,
    /// Sustained damage per second
    pub dps: f32,
    /// Projectile speed in units/s, 0 for hitscan
    pub projectile_speed: f32,
    pub gravity: bool,
    pub splash_radius: f32,
    /// How dangerous it is to face this weapon (0..1)
    pub danger: f32,
}

static WEAPON_STATS: [WeaponStats; WEAPON_COUNT] = [
    WeaponStats { name: "gauntlet", min_range: 0.0, optimal_range: 32.0, max_range: 64.0, dps: 125.0, projectile_speed: 0.0, gravity: false, splash_radius: 0.0, danger: 0.2 },
    WeaponStats { name: "machinegun", min_range: 0.0, optimal_range: 500.0, max_range: 1500.0, dps: 70.0, projectile_speed: 0.0, gravity: false, splash_radius: 0.0, danger: 0.3 },
    WeaponStats { name: "shotgun", min_range: 0.0, optimal_range: 150.0, max_range: 600.0, dps: 110.0, projectile_speed: 0.0, gravity: false, splash_radius: 0.0, danger: 0.5 },
    WeaponStats { name: "grenade launcher", min_range: 150.0, optimal_range: 400.0, max_range: 800.0, dps: 125.0, projectile_speed: 700.0, gravity: true, splash_radius: 150.0, danger: 0.5 },
    WeaponStats { name: "rocket launcher", min_range: 150.0, optimal_range: 450.0, max_range: 1200.0, dps: 125.0, projectile_speed: 900.0, gravity: false, splash_radius: 120.0, danger: 0.8 },
    WeaponStats { name: "lightning gun", min_range: 0.0, optimal_range: 400.0, max_range: 768.0, dps: 160.0, projectile_speed: 0.0, gravity: false, splash_radius: 0.0, danger: 0.7 },
    WeaponStats { name: "railgun", min_range: 200.0, optimal_range: 1200.0, max_range: 3000.0, dps: 67.0, projectile_speed: 0.0, gravity: false, splash_radius: 0.0, danger: 0.8 },
    WeaponStats { name: "plasma gun", min_range: 100.0, optimal_range: 400.0, max_range: 1000.0, dps: 200.0, projectile_speed: 2000.0, gravity: false, splash_radius: 20.0, danger: 0.6 },
    WeaponStats { name: "bfg", min_range: 200.0, optimal_range: 600.0, max_range: 1500.0, dps: 500.0, projectile_speed: 2000.0, gravity: false, splash_radius: 120.0, danger: 1.0 },
];

impl Weapon {
    pub const ALL: [Weapon; WEAPON_COUNT] = [
        Weapon::Gauntlet,
        Weapon::Machinegun,
        Weapon::Shotgun,
        Weapon::GrenadeLauncher,
        Weapon::RocketLauncher,
        Weapon::LightningGun,
        Weapon::Railgun,
        Weapon::PlasmaGun,
        Weapon::Bfg,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    #[inline]
    pub fn stats(self) -> &'static WeaponStats {
        &WEAPON_STATS[self.index()]
    }

    #[inline]
    pub fn is_hitscan(self) -> bool {
        self.stats().projectile_speed <= 0.0
    }

    /// Normalized tier used by strength estimates (0..1)
    pub fn tier(self) -> f32 {
        self.stats().dps.min(250.0) / 250.0
    }
}

/// What a player carries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    /// Bit per weapon index
    pub weapons: u16,
    pub ammo: [i32; WEAPON_COUNT],
}

impl Inventory {
    /// Spawn loadout: gauntlet and a machinegun with 100 rounds
    pub fn spawn_loadout() -> Self {
        let mut inv = Self::default();
        inv.give(Weapon::Gauntlet, 0);
        inv.give(Weapon::Machinegun, 100);
        inv
    }

    pub fn give(&mut self, weapon: Weapon, ammo: i32) {
        self.weapons |= 1 << weapon.index();
        self.ammo[weapon.index()] += ammo;
    }

    #[inline]
    pub fn has(&self, weapon: Weapon) -> bool {
        self.weapons & (1 << weapon.index()) != 0
    }

    #[inline]
    pub fn ammo(&self, weapon: Weapon) -> i32 {
        self.ammo[weapon.index()]
    }

    /// Carried and able to fire (the gauntlet needs no ammo)
    pub fn usable(&self, weapon: Weapon) -> bool {
        self.has(weapon) && (weapon == Weapon::Gauntlet || self.ammo(weapon) > 0)
    }

    pub fn usable_weapons(&self) -> impl Iterator<Item = Weapon> + '_ {
        Weapon::ALL.into_iter().filter(move |w| self.usable(*w))
    }

}
