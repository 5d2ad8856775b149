use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod map;
pub mod movement;

pub use map::{MapError, Obstacle, ObstacleMap};
pub use movement::MoveKeys;

pub const TICK_RATE: u32 = 60;
pub const TICK_DT: f32 = 1.0 / TICK_RATE as f32;

pub const ARENA_WIDTH: f32 = 7500.0;
pub const ARENA_HEIGHT: f32 = 7500.0;
pub const BORDER_THICKNESS: f32 = 150.0;

pub const TANK_SIZE: f32 = 30.0;
/// Collision box is slightly smaller than the drawn tank
pub const TANK_COLLISION_SIZE: f32 = TANK_SIZE * 0.9;
pub const MOVE_SPEED: f32 = 200.0;

pub const BULLET_SPEED: f32 = 500.0;
pub const BULLET_LIFETIME: f32 = 2.0;
pub const BULLET_SIZE: f32 = 6.0;
pub const MUZZLE_OFFSET: f32 = TANK_SIZE / 2.0 + 5.0;
pub const SHOOT_COOLDOWN: f32 = 0.3;

pub const INVINCIBILITY_SECONDS: f32 = 1.5;

/// Stake paid to enter the arena, in minor currency units
pub const ENTRY_FEE: u64 = 100;

/// External identity key of a user
pub type UserId = String;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Interpolates between two angles along the shorter arc
pub fn lerp_angle(from: f32, to: f32, alpha: f32) -> f32 {
    use std::f32::consts::{PI, TAU};

    let mut diff = (to - from) % TAU;
    if diff > PI {
        diff -= TAU;
    } else if diff < -PI {
        diff += TAU;
    }
    from + diff * alpha
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Join {
        user_id: UserId,
        name: String,
        color: u32,
    },
    Input {
        sequence: u32,
        timestamp: u64,
        keys: MoveKeys,
        aim_x: f32,
        aim_y: f32,
        shoot: bool,
    },
    CashOut,
    Quit,
    Ping {
        timestamp: u64,
    },

    Welcome {
        client_id: u32,
        map: ObstacleMap,
    },
    JoinSucceeded {
        wallet_balance: u64,
        pot: u64,
    },
    JoinFailed {
        reason: FailureReason,
    },
    CashOutResult {
        reason: Option<FailureReason>,
        cashed_out: u64,
        wallet_balance: u64,
        pot: u64,
    },
    State {
        tick: u32,
        timestamp: u64,
        players: Vec<PlayerState>,
        bullets: Vec<BulletState>,
    },
    Hit {
        killer_id: Option<u32>,
    },
    HitConfirmed {
        target_id: u32,
    },
    Death {
        victim_id: u32,
        killer_id: Option<u32>,
        killer_name: Option<String>,
        killer_color: Option<u32>,
        x: f32,
        y: f32,
    },
    PotUpdate {
        wallet_balance: u64,
        pot: u64,
    },
    BulletFired,
    BulletImpact {
        x: f32,
        y: f32,
        kind: ImpactKind,
    },
    Scoreboard {
        entries: Vec<ScoreEntry>,
    },
    ForceDisconnect {
        reason: String,
    },
    Disconnected {
        reason: String,
    },
    Pong {
        timestamp: u64,
    },
}

/// Player record carried in every snapshot
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerState {
    pub id: u32,
    pub name: String,
    pub color: u32,
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub kills: u32,
    pub deaths: u32,
    pub invincible: bool,
    pub pot: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BulletState {
    pub id: u32,
    pub owner: u32,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScoreEntry {
    pub id: u32,
    pub name: String,
    pub kills: u32,
    pub deaths: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ImpactKind {
    Border,
    Wall,
    Shield,
}

/// Why a join or cash-out request was refused
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum FailureReason {
    PlayerNotFound,
    MissingIdentity,
    AlreadyInGame,
    InsufficientFunds { balance: u64, required: u64 },
    NotInGame,
    Busy,
    ProviderUnavailable,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::PlayerNotFound => write!(f, "player not found"),
            FailureReason::MissingIdentity => write!(f, "user id missing"),
            FailureReason::AlreadyInGame => write!(f, "already in game"),
            FailureReason::InsufficientFunds { balance, required } => {
                write!(f, "insufficient funds: have {}, need {}", balance, required)
            }
            FailureReason::NotInGame => write!(f, "not in game"),
            FailureReason::Busy => write!(f, "another wallet operation is in progress"),
            FailureReason::ProviderUnavailable => write!(f, "wallet service unavailable"),
        }
    }
}

/// Input sample as sent by a client
#[derive(Debug, Clone, PartialEq)]
pub struct InputState {
    pub sequence: u32,
    pub timestamp: u64,
    pub keys: MoveKeys,
    pub aim_x: f32,
    pub aim_y: f32,
    pub shoot: bool,
}

impl InputState {
    /// Returns false if any float is NaN or infinite
    pub fn is_well_formed(&self) -> bool {
        self.aim_x.is_finite() && self.aim_y.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f32::consts::PI;

    #[test]
    fn test_lerp_angle_takes_short_path_across_wrap() {
        // 3.0 -> -3.0 should pass through PI, not back through 0
        let mid = lerp_angle(3.0, -3.0, 0.5);
        assert_approx_eq!(mid, PI, 1e-3);

        let quarter = lerp_angle(3.0, -3.0, 0.25);
        assert!(quarter > 3.0);
    }

    #[test]
    fn test_lerp_angle_plain_range() {
        assert_approx_eq!(lerp_angle(0.0, 1.0, 0.5), 0.5, 1e-6);
        assert_approx_eq!(lerp_angle(1.0, -1.0, 0.5), 0.0, 1e-6);
        assert_approx_eq!(lerp_angle(-3.0, 3.0, 0.5), -PI, 1e-3);
    }

    #[test]
    fn test_lerp_angle_endpoints() {
        assert_approx_eq!(lerp_angle(2.5, -2.5, 0.0), 2.5, 1e-6);
        let end = lerp_angle(2.5, -2.5, 1.0);
        // Same direction as -2.5, possibly expressed past PI
        assert_approx_eq!(end.sin(), (-2.5f32).sin(), 1e-5);
        assert_approx_eq!(end.cos(), (-2.5f32).cos(), 1e-5);
    }

    #[test]
    fn test_input_well_formed() {
        let mut input = InputState {
            sequence: 1,
            timestamp: 10,
            keys: MoveKeys::default(),
            aim_x: 5.0,
            aim_y: 5.0,
            shoot: false,
        };
        assert!(input.is_well_formed());
        input.aim_x = f32::NAN;
        assert!(!input.is_well_formed());
    }

    #[test]
    fn test_packet_serialization_input() {
        let packet = Packet::Input {
            sequence: 123,
            timestamp: 456789,
            keys: MoveKeys {
                up: true,
                left: true,
                ..Default::default()
            },
            aim_x: 10.0,
            aim_y: -4.0,
            shoot: true,
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Input {
                sequence,
                keys,
                aim_y,
                shoot,
                ..
            } => {
                assert_eq!(sequence, 123);
                assert!(keys.up && keys.left && !keys.right);
                assert_eq!(aim_y, -4.0);
                assert!(shoot);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_welcome_fits_in_one_datagram() {
        use rand::SeedableRng;

        let map = ObstacleMap::arena(&mut rand::rngs::StdRng::seed_from_u64(1));
        let packet = Packet::Welcome { client_id: 1, map };
        let serialized = bincode::serialize(&packet).unwrap();
        assert!(serialized.len() < 8 * 1024);
    }

    #[test]
    fn test_failure_reason_is_specific() {
        let reason = FailureReason::InsufficientFunds {
            balance: 99,
            required: 100,
        };
        assert_eq!(reason.to_string(), "insufficient funds: have 99, need 100");
        assert_ne!(FailureReason::Busy, FailureReason::NotInGame);
    }
}
