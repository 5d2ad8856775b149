//! Server-side player entity and its lifecycle

use shared::{FailureReason, PlayerState, UserId};

/// Where a player is in the join / play / death cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lifecycle {
    /// Ledger join in flight
    Joining,
    /// Connected but not in the arena
    Spectating,
    Alive { invincible_for: f32 },
    /// Eliminated this tick; removed once the tick finishes
    Dead,
}

#[derive(Debug, Clone)]
pub struct Player {
    pub id: u32,
    pub user_id: UserId,
    pub name: String,
    pub color: u32,
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub kills: u32,
    pub deaths: u32,
    pub phase: Lifecycle,
    /// Client timestamp of the last accepted input
    pub last_input_time: Option<u64>,
    /// Simulation time of the last shot
    pub last_shot: Option<f64>,
    pub violations: u32,
}

impl Player {
    pub fn new(id: u32, user_id: UserId, name: String, color: u32) -> Self {
        Self {
            id,
            user_id,
            name,
            color,
            x: 0.0,
            y: 0.0,
            angle: 0.0,
            kills: 0,
            deaths: 0,
            phase: Lifecycle::Joining,
            last_input_time: None,
            last_shot: None,
            violations: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.phase, Lifecycle::Alive { .. })
    }

    pub fn is_invincible(&self) -> bool {
        matches!(self.phase, Lifecycle::Alive { invincible_for } if invincible_for > 0.0)
    }

    /// Spectating -> Joining
    pub fn rejoin(&mut self) -> Result<(), FailureReason> {
        match self.phase {
            Lifecycle::Spectating => {
                self.phase = Lifecycle::Joining;
                Ok(())
            }
            Lifecycle::Alive { .. } => Err(FailureReason::AlreadyInGame),
            Lifecycle::Joining | Lifecycle::Dead => Err(FailureReason::Busy),
        }
    }

    /// Joining -> Alive at the given position
    pub fn spawn(&mut self, x: f32, y: f32, invincibility: f32) -> bool {
        if self.phase != Lifecycle::Joining {
            return false;
        }
        self.x = x;
        self.y = y;
        self.angle = 0.0;
        self.last_input_time = None;
        self.last_shot = None;
        self.phase = Lifecycle::Alive {
            invincible_for: invincibility,
        };
        true
    }

    /// Joining -> Spectating
    pub fn fail_join(&mut self) -> bool {
        if self.phase != Lifecycle::Joining {
            return false;
        }
        self.phase = Lifecycle::Spectating;
        true
    }

    /// Alive -> Dead
    pub fn eliminate(&mut self) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.deaths += 1;
        self.phase = Lifecycle::Dead;
        true
    }

    pub fn tick_invincibility(&mut self, dt: f32) {
        if let Lifecycle::Alive { invincible_for } = &mut self.phase {
            if *invincible_for > 0.0 {
                *invincible_for = (*invincible_for - dt).max(0.0);
            }
        }
    }

    pub fn to_state(&self, pot: u64) -> PlayerState {
        PlayerState {
            id: self.id,
            name: self.name.clone(),
            color: self.color,
            x: self.x,
            y: self.y,
            angle: self.angle,
            kills: self.kills,
            deaths: self.deaths,
            invincible: self.is_invincible(),
            pot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player() -> Player {
        Player::new(1, "user-1".to_string(), "Tank".to_string(), 0xff0000)
    }

    #[test]
    fn test_new_player_is_joining() {
        let p = player();
        assert_eq!(p.phase, Lifecycle::Joining);
        assert!(!p.is_alive());
        assert!(!p.is_invincible());
    }

    #[test]
    fn test_spawn_grants_invincibility() {
        let mut p = player();
        assert!(p.spawn(100.0, 200.0, 1.5));
        assert!(p.is_alive());
        assert!(p.is_invincible());
        assert_eq!((p.x, p.y), (100.0, 200.0));

        p.tick_invincibility(1.0);
        assert!(p.is_invincible());
        p.tick_invincibility(1.0);
        assert!(!p.is_invincible());
        assert_eq!(p.phase, Lifecycle::Alive { invincible_for: 0.0 });
    }

    #[test]
    fn test_spawn_only_from_joining() {
        let mut p = player();
        assert!(p.fail_join());
        assert!(!p.spawn(0.0, 0.0, 1.5));
        assert_eq!(p.phase, Lifecycle::Spectating);
    }

    #[test]
    fn test_rejoin_transitions() {
        let mut p = player();
        assert_eq!(p.rejoin(), Err(FailureReason::Busy));

        p.fail_join();
        assert_eq!(p.rejoin(), Ok(()));
        assert_eq!(p.phase, Lifecycle::Joining);

        p.spawn(10.0, 10.0, 0.0);
        assert_eq!(p.rejoin(), Err(FailureReason::AlreadyInGame));
    }

    #[test]
    fn test_eliminate() {
        let mut p = player();
        assert!(!p.eliminate());

        p.spawn(10.0, 10.0, 0.0);
        assert!(p.eliminate());
        assert_eq!(p.phase, Lifecycle::Dead);
        assert_eq!(p.deaths, 1);
        assert!(!p.eliminate());
        assert_eq!(p.deaths, 1);
    }

    #[test]
    fn test_to_state_carries_pot() {
        let mut p = player();
        p.spawn(5.0, 6.0, 1.0);
        let state = p.to_state(250);
        assert_eq!(state.id, 1);
        assert_eq!(state.pot, 250);
        assert!(state.invincible);
    }
}
