//! Client-side prediction, interpolation and reconciliation
//!
//! The local tank is predicted every frame with the same step function the
//! server uses. Everything else is drawn from the snapshot buffer at
//! `now - interpolation_delay`, and the predicted tank is pulled toward the
//! interpolated server position of the local player.

use crate::buffer::{Bracket, Snapshot, SnapshotBuffer, BUFFER_CAPACITY, BUFFER_WINDOW_MS};
use log::debug;
use shared::map::ObstacleMap;
use shared::movement::{aim_angle, step};
use shared::{lerp_angle, BulletState, MoveKeys, PlayerState};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Prediction error above which the local tank snaps to the server position
    pub reconcile_threshold: f32,
    /// Fraction of the prediction error removed per frame below the threshold
    pub smoothing: f32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Delay used before the first round trip has been measured
    pub initial_delay_ms: u64,
    pub buffer_window_ms: u64,
    pub buffer_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconcile_threshold: 50.0,
            smoothing: 0.15,
            min_delay_ms: 50,
            max_delay_ms: 200,
            initial_delay_ms: 100,
            buffer_window_ms: BUFFER_WINDOW_MS,
            buffer_capacity: BUFFER_CAPACITY,
        }
    }
}

/// Netcode features that can be switched off at runtime for comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub prediction: bool,
    pub reconciliation: bool,
    pub interpolation: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            prediction: true,
            reconciliation: true,
            interpolation: true,
        }
    }
}

/// Predicted pose of the local tank
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalTank {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    None,
    Blended { error: f32 },
    Snapped { error: f32 },
}

/// Everything the renderer needs for one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderFrame {
    pub players: Vec<PlayerState>,
    pub bullets: Vec<BulletState>,
}

impl RenderFrame {
    pub fn player(&self, id: u32) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.id == id)
    }
}

pub struct ClientGameState {
    config: ClientConfig,
    map: Option<ObstacleMap>,
    local_id: Option<u32>,
    predicted: Option<LocalTank>,
    buffer: SnapshotBuffer,
    rtt_ms: Option<u64>,
    interpolation_delay_ms: u64,
    last_correction: Correction,
}

impl Default for ClientGameState {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl ClientGameState {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            buffer: SnapshotBuffer::new(config.buffer_window_ms, config.buffer_capacity),
            interpolation_delay_ms: config.initial_delay_ms,
            config,
            map: None,
            local_id: None,
            predicted: None,
            rtt_ms: None,
            last_correction: Correction::None,
        }
    }

    pub fn set_map(&mut self, map: ObstacleMap) {
        self.map = Some(map);
    }

    pub fn map(&self) -> Option<&ObstacleMap> {
        self.map.as_ref()
    }

    pub fn set_local_id(&mut self, id: u32) {
        if self.local_id != Some(id) {
            self.predicted = None;
        }
        self.local_id = Some(id);
    }

    pub fn local_id(&self) -> Option<u32> {
        self.local_id
    }

    pub fn predicted(&self) -> Option<LocalTank> {
        self.predicted
    }

    pub fn last_correction(&self) -> Correction {
        self.last_correction
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.buffer.latest()
    }

    /// Forgets every server state, e.g. after leaving the arena
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.predicted = None;
        self.last_correction = Correction::None;
    }

    pub fn rtt_ms(&self) -> Option<u64> {
        self.rtt_ms
    }

    /// Records a measured round trip and retunes the interpolation delay
    pub fn update_rtt(&mut self, rtt_ms: u64) {
        self.rtt_ms = Some(rtt_ms);
        self.interpolation_delay_ms =
            (rtt_ms / 2).clamp(self.config.min_delay_ms, self.config.max_delay_ms);
    }

    pub fn interpolation_delay(&self) -> u64 {
        self.interpolation_delay_ms
    }

    /// Buffers an authoritative state received at local time `received_at`
    pub fn apply_server_state(
        &mut self,
        received_at: u64,
        tick: u32,
        players: Vec<PlayerState>,
        bullets: Vec<BulletState>,
    ) {
        let snapshot = Snapshot {
            received_at,
            tick,
            players,
            bullets,
        };

        match self.local_id.and_then(|id| snapshot.player(id)) {
            Some(me) => {
                if self.predicted.is_none() {
                    debug!("Local tank appeared at ({:.0}, {:.0})", me.x, me.y);
                    self.predicted = Some(LocalTank {
                        x: me.x,
                        y: me.y,
                        angle: me.angle,
                    });
                }
            }
            None => self.predicted = None,
        }

        self.buffer.push(snapshot);
    }

    /// Advances the predicted local tank by one input
    pub fn predict(&mut self, keys: MoveKeys, aim_x: f32, aim_y: f32, dt: f32) {
        let (Some(map), Some(tank)) = (self.map.as_ref(), self.predicted.as_mut()) else {
            return;
        };
        let next = step(map, tank.x, tank.y, keys, dt);
        tank.x = next.x;
        tank.y = next.y;
        tank.angle = aim_angle(tank.x, tank.y, aim_x, aim_y);
    }

    /// Pulls the predicted tank toward a server position
    ///
    /// Errors above the threshold snap; smaller ones shrink by the smoothing
    /// fraction.
    pub fn reconcile(&mut self, server_x: f32, server_y: f32, server_angle: f32) -> Correction {
        let Some(tank) = self.predicted.as_mut() else {
            return Correction::None;
        };
        let error = (server_x - tank.x).hypot(server_y - tank.y);

        let correction = if error > self.config.reconcile_threshold {
            debug!("Prediction off by {:.1}, snapping", error);
            *tank = LocalTank {
                x: server_x,
                y: server_y,
                angle: server_angle,
            };
            Correction::Snapped { error }
        } else {
            let s = self.config.smoothing;
            tank.x += (server_x - tank.x) * s;
            tank.y += (server_y - tank.y) * s;
            tank.angle = lerp_angle(tank.angle, server_angle, s);
            Correction::Blended { error }
        };

        self.last_correction = correction;
        correction
    }

    /// Builds the frame to draw at local time `now`
    pub fn frame(&mut self, now: u64, features: Features) -> RenderFrame {
        let mut frame = if features.interpolation {
            self.interpolated(now.saturating_sub(self.interpolation_delay_ms))
        } else {
            self.buffer.latest().map(raw_frame).unwrap_or_default()
        };

        let Some(local_id) = self.local_id else {
            return frame;
        };
        let server_pose = frame.player(local_id).map(|p| (p.x, p.y, p.angle));

        if let Some((x, y, angle)) = server_pose {
            if !features.prediction {
                self.predicted = Some(LocalTank { x, y, angle });
                return frame;
            }
            if features.reconciliation {
                self.reconcile(x, y, angle);
            }
        }

        if let Some(tank) = self.predicted {
            if let Some(me) = frame.players.iter_mut().find(|p| p.id == local_id) {
                me.x = tank.x;
                me.y = tank.y;
                me.angle = tank.angle;
            }
        }
        frame
    }

    fn interpolated(&self, render_time: u64) -> RenderFrame {
        match self.buffer.bracket(render_time) {
            Bracket::Empty => RenderFrame::default(),
            Bracket::Latest(snapshot) => raw_frame(snapshot),
            Bracket::Between { from, to, alpha } => interpolate(from, to, alpha),
        }
    }
}

fn raw_frame(snapshot: &Snapshot) -> RenderFrame {
    RenderFrame {
        players: snapshot.players.clone(),
        bullets: snapshot.bullets.clone(),
    }
}

/// Blends two snapshots; entities present in only one of them are taken as is
fn interpolate(from: &Snapshot, to: &Snapshot, alpha: f32) -> RenderFrame {
    let mut players: Vec<PlayerState> = to
        .players
        .iter()
        .map(|next| match from.player(next.id) {
            Some(prev) => PlayerState {
                x: prev.x + (next.x - prev.x) * alpha,
                y: prev.y + (next.y - prev.y) * alpha,
                angle: lerp_angle(prev.angle, next.angle, alpha),
                ..next.clone()
            },
            None => next.clone(),
        })
        .collect();
    players.extend(
        from.players
            .iter()
            .filter(|p| to.player(p.id).is_none())
            .cloned(),
    );

    let mut bullets: Vec<BulletState> = to
        .bullets
        .iter()
        .map(|next| match from.bullet(next.id) {
            Some(prev) => BulletState {
                x: prev.x + (next.x - prev.x) * alpha,
                y: prev.y + (next.y - prev.y) * alpha,
                ..next.clone()
            },
            None => next.clone(),
        })
        .collect();
    bullets.extend(
        from.bullets
            .iter()
            .filter(|b| to.bullet(b.id).is_none())
            .cloned(),
    );

    RenderFrame { players, bullets }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::map::Obstacle;
    use shared::{MOVE_SPEED, TICK_DT};
    use std::f32::consts::PI;

    fn tank(id: u32, x: f32, y: f32, angle: f32) -> PlayerState {
        PlayerState {
            id,
            name: format!("P{}", id),
            color: 0,
            x,
            y,
            angle,
            kills: 0,
            deaths: 0,
            invincible: false,
            pot: 100,
        }
    }

    fn bullet(id: u32, x: f32, y: f32) -> BulletState {
        BulletState { id, owner: 9, x, y }
    }

    fn open_map() -> ObstacleMap {
        ObstacleMap::new(
            2000.0,
            2000.0,
            100.0,
            vec![
                Obstacle::new(0.0, 0.0, 2000.0, 100.0),
                Obstacle::new(0.0, 1900.0, 2000.0, 100.0),
                Obstacle::new(0.0, 0.0, 100.0, 2000.0),
                Obstacle::new(1900.0, 0.0, 100.0, 2000.0),
            ],
        )
    }

    fn joined_state(x: f32, y: f32) -> ClientGameState {
        let mut state = ClientGameState::default();
        state.set_map(open_map());
        state.set_local_id(1);
        state.apply_server_state(1000, 1, vec![tank(1, x, y, 0.0)], Vec::new());
        state
    }

    #[test]
    fn test_interpolation_delay_follows_rtt() {
        let mut state = ClientGameState::default();
        assert_eq!(state.interpolation_delay(), 100);

        state.update_rtt(40);
        assert_eq!(state.interpolation_delay(), 50);
        state.update_rtt(240);
        assert_eq!(state.interpolation_delay(), 120);
        state.update_rtt(1000);
        assert_eq!(state.interpolation_delay(), 200);
    }

    #[test]
    fn test_prediction_starts_from_first_server_state() {
        let state = joined_state(500.0, 600.0);
        assert_eq!(
            state.predicted(),
            Some(LocalTank {
                x: 500.0,
                y: 600.0,
                angle: 0.0
            })
        );
    }

    #[test]
    fn test_predict_uses_shared_step() {
        let mut state = joined_state(500.0, 500.0);
        let keys = MoveKeys {
            right: true,
            ..MoveKeys::default()
        };
        state.predict(keys, 1000.0, 500.0, TICK_DT);

        let tank = state.predicted().unwrap();
        assert_approx_eq!(tank.x, 500.0 + MOVE_SPEED * TICK_DT, 1e-3);
        assert_approx_eq!(tank.y, 500.0, 1e-6);
        assert_approx_eq!(tank.angle, 0.0, 1e-6);
    }

    #[test]
    fn test_predict_stops_at_walls() {
        let mut state = joined_state(130.0, 500.0);
        let keys = MoveKeys {
            left: true,
            ..MoveKeys::default()
        };
        for _ in 0..60 {
            state.predict(keys, 0.0, 500.0, TICK_DT);
        }
        assert!(state.predicted().unwrap().x >= 100.0);
    }

    #[test]
    fn test_small_error_is_blended() {
        let mut state = joined_state(100.0, 100.0);
        let correction = state.reconcile(120.0, 100.0, 0.0);

        assert_eq!(correction, Correction::Blended { error: 20.0 });
        assert_approx_eq!(state.predicted().unwrap().x, 103.0, 1e-4);
    }

    #[test]
    fn test_large_error_snaps() {
        let mut state = joined_state(100.0, 100.0);
        let correction = state.reconcile(100.0, 200.0, 1.0);

        assert!(matches!(correction, Correction::Snapped { .. }));
        assert_eq!(
            state.predicted(),
            Some(LocalTank {
                x: 100.0,
                y: 200.0,
                angle: 1.0
            })
        );
    }

    #[test]
    fn test_reconciliation_converges() {
        let mut state = joined_state(100.0, 100.0);
        for _ in 0..60 {
            state.reconcile(140.0, 70.0, 0.5);
        }
        let tank = state.predicted().unwrap();
        assert_approx_eq!(tank.x, 140.0, 0.01);
        assert_approx_eq!(tank.y, 70.0, 0.01);
        assert_approx_eq!(tank.angle, 0.5, 0.01);
    }

    #[test]
    fn test_frame_interpolates_remote_players_and_bullets() {
        let mut state = ClientGameState::default();
        state.set_local_id(1);
        state.apply_server_state(
            1000,
            1,
            vec![tank(2, 0.0, 0.0, 3.0)],
            vec![bullet(7, 10.0, 10.0)],
        );
        state.apply_server_state(
            1100,
            2,
            vec![tank(2, 100.0, 50.0, -3.0)],
            vec![bullet(7, 30.0, 10.0), bullet(8, 0.0, 0.0)],
        );

        // Delay is 100ms, so render time 1050 sits halfway
        let frame = state.frame(1150, Features::default());
        let remote = frame.player(2).unwrap();
        assert_approx_eq!(remote.x, 50.0, 1e-4);
        assert_approx_eq!(remote.y, 25.0, 1e-4);
        // Shortest path from 3.0 to -3.0 goes through pi
        assert!(remote.angle.abs() > 3.0);

        assert_eq!(frame.bullets.len(), 2);
        let b7 = frame.bullets.iter().find(|b| b.id == 7).unwrap();
        assert_approx_eq!(b7.x, 20.0, 1e-4);
    }

    #[test]
    fn test_angle_wrap_interpolation_goes_through_pi() {
        let from = Snapshot {
            received_at: 0,
            tick: 0,
            players: vec![tank(2, 0.0, 0.0, 3.0)],
            bullets: Vec::new(),
        };
        let to = Snapshot {
            received_at: 10,
            tick: 1,
            players: vec![tank(2, 0.0, 0.0, -3.0)],
            bullets: Vec::new(),
        };
        let frame = interpolate(&from, &to, 0.5);
        let angle = frame.players[0].angle;
        assert!((angle.abs() - PI).abs() < 1e-4);
    }

    #[test]
    fn test_frame_with_empty_buffer() {
        let mut state = ClientGameState::default();
        assert_eq!(state.frame(1000, Features::default()), RenderFrame::default());
    }

    #[test]
    fn test_frame_renders_prediction_for_local_player() {
        let mut state = joined_state(500.0, 500.0);
        state.predict(
            MoveKeys {
                down: true,
                ..MoveKeys::default()
            },
            500.0,
            1000.0,
            TICK_DT,
        );
        let predicted = state.predicted().unwrap();

        let features = Features {
            reconciliation: false,
            ..Features::default()
        };
        let frame = state.frame(1000, features);
        let me = frame.player(1).unwrap();
        assert_eq!((me.x, me.y), (predicted.x, predicted.y));
    }

    #[test]
    fn test_local_player_leaving_clears_prediction() {
        let mut state = joined_state(500.0, 500.0);
        state.apply_server_state(1016, 2, vec![tank(2, 0.0, 0.0, 0.0)], Vec::new());
        assert!(state.predicted().is_none());
    }
}
