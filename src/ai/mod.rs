//! Bot decision core
//!
//! Each bot runs perception, threat assessment, planning, combat and
//! movement decisions once per think and emits one [`crate::world::UserCmd`].

/// Per-subsystem detail log: `debug!` when the subsystem's debug toggle is
/// on, `trace!` otherwise
macro_rules! detail {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    };
}
pub(crate) use detail;

pub mod character;
pub mod combat;
pub mod constants;
pub mod controller;
pub mod cover;
pub mod manager;
pub mod movement;
pub mod neural;
pub mod perception;
pub mod ppo;
pub mod skill;
pub mod strategy;
pub mod team;
pub mod weapons;

pub use controller::{BotController, BotState, ClientId};
pub use manager::{AiManager, BotError, BotEvent};
