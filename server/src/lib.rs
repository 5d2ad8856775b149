//! # Tank Arena Server
//!
//! Authoritative server for the tank arena. It owns the only real copy of the
//! world, validates and applies client inputs at a fixed tick rate, and
//! broadcasts a full snapshot of every live tank and bullet after each tick.
//!
//! ## Modules
//!
//! - [`client_manager`]: UDP sessions, their identities and queued inputs
//! - [`player`]: per-session tank lifecycle
//! - [`spawn`]: spawn point selection against live tanks and the obstacle map
//! - [`anticheat`]: rate limiting and movement clamping of inputs
//! - [`game`]: the simulation itself (movement, bullets, kills)
//! - [`ledger`]: per-identity locked wallet operations against a balance provider
//! - [`network`]: transport tasks and the tick loop tying everything together
//!
//! ## Ownership
//!
//! The tick loop is the single owner of [`game::GameState`]. Socket tasks only
//! queue packets for it, and ledger operations run as separate tasks whose
//! results come back through the same queue. The ledger is the one structure
//! shared across tasks, and it serialises work per identity with try-locks.

pub mod anticheat;
pub mod client_manager;
pub mod game;
pub mod ledger;
pub mod network;
pub mod player;
pub mod spawn;
