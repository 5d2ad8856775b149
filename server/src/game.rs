use crate::anticheat::{CheatViolation, GateConfig, InputGate};
use crate::ledger::{KillSettlement, Ledger};
use crate::player::{Lifecycle, Player};
use crate::spawn::{SpawnConfig, SpawnSelector};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::map::ObstacleMap;
use shared::movement::{aim_angle, integrate, velocity};
use shared::{
    BulletState, FailureReason, ImpactKind, InputState, PlayerState, ScoreEntry, UserId,
    BULLET_LIFETIME, BULLET_SIZE, BULLET_SPEED, INVINCIBILITY_SECONDS, MOVE_SPEED,
    MUZZLE_OFFSET, SHOOT_COOLDOWN, TANK_SIZE, TICK_RATE,
};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Simulated seconds covered by one accepted input
    pub tick_dt: f32,
    pub shoot_cooldown: f32,
    pub invincibility_seconds: f32,
    pub bullet_speed: f32,
    pub bullet_lifetime: f32,
    /// Distance from a tank centre within which a bullet hits
    pub hit_radius: f32,
    pub spawn: SpawnConfig,
    pub gate: GateConfig,
}

impl GameConfig {
    pub fn for_tick_rate(tick_rate: u32) -> Self {
        Self {
            tick_dt: 1.0 / tick_rate as f32,
            gate: GateConfig::for_tick_rate(tick_rate, MOVE_SPEED),
            ..Self::default()
        }
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            tick_dt: 1.0 / TICK_RATE as f32,
            shoot_cooldown: SHOOT_COOLDOWN,
            invincibility_seconds: INVINCIBILITY_SECONDS,
            bullet_speed: BULLET_SPEED,
            bullet_lifetime: BULLET_LIFETIME,
            hit_radius: TANK_SIZE / 2.0,
            spawn: SpawnConfig::default(),
            gate: GateConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bullet {
    pub id: u32,
    pub owner: u32,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub lifetime: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KillerInfo {
    pub id: u32,
    pub name: String,
    pub color: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KillReport {
    pub victim: u32,
    pub victim_user: UserId,
    pub killer: Option<KillerInfo>,
    pub x: f32,
    pub y: f32,
    pub settlement: KillSettlement,
}

/// Things that happened during input handling or a tick that clients need to hear about
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    BulletFired { owner: u32 },
    BulletImpact { x: f32, y: f32, kind: ImpactKind },
    PlayerKilled(KillReport),
    /// The ledger could not lock both identities; the victim survives
    KillAbandoned { victim: u32, killer: Option<u32> },
}

/// Periodic summary for the server log
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GameStats {
    pub players: usize,
    pub bullets: usize,
    pub width: f32,
    pub height: f32,
    pub forfeited: u64,
}

impl std::fmt::Display for GameStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} players, {} bullets, arena {}x{}, {} forfeited",
            self.players, self.bullets, self.width, self.height, self.forfeited
        )
    }
}

pub struct GameState {
    pub tick: u32,
    /// Simulation clock in seconds
    pub time: f64,
    pub players: HashMap<u32, Player>,
    pub bullets: Vec<Bullet>,
    map: Arc<ObstacleMap>,
    config: GameConfig,
    spawner: SpawnSelector,
    gate: InputGate,
    rng: StdRng,
    next_bullet_id: u32,
    /// Deaths per identity, carried into the identity's next life
    deaths: HashMap<UserId, u32>,
}

impl GameState {
    pub fn new(map: Arc<ObstacleMap>, config: GameConfig) -> Self {
        Self::with_rng(map, config, StdRng::from_entropy())
    }

    pub fn with_seed(map: Arc<ObstacleMap>, config: GameConfig, seed: u64) -> Self {
        Self::with_rng(map, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(map: Arc<ObstacleMap>, config: GameConfig, rng: StdRng) -> Self {
        Self {
            tick: 0,
            time: 0.0,
            players: HashMap::new(),
            bullets: Vec::new(),
            spawner: SpawnSelector::new(&map, config.spawn.clone()),
            gate: InputGate::new(config.gate.clone()),
            map,
            config,
            rng,
            next_bullet_id: 1,
            deaths: HashMap::new(),
        }
    }

    pub fn map(&self) -> &ObstacleMap {
        &self.map
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    /// Registers a join request for a session
    ///
    /// Creates the player in `Joining` if the session has none, or moves a
    /// spectating player back to `Joining`.
    pub fn begin_join(
        &mut self,
        session: u32,
        user_id: UserId,
        name: String,
        color: u32,
    ) -> Result<(), FailureReason> {
        let deaths = self.deaths.get(&user_id).copied().unwrap_or(0);
        match self.players.get_mut(&session) {
            Some(player) => {
                player.rejoin()?;
                player.user_id = user_id;
                player.name = name;
                player.color = color;
                player.deaths = deaths;
            }
            None => {
                let mut player = Player::new(session, user_id, name, color);
                player.deaths = deaths;
                self.players.insert(session, player);
            }
        }
        Ok(())
    }

    /// Places a joining player in the arena once its entry fee is paid
    pub fn spawn_player(&mut self, session: u32) -> Option<(f32, f32)> {
        let live: Vec<(f32, f32)> = self
            .players
            .values()
            .filter(|p| p.is_alive())
            .map(|p| (p.x, p.y))
            .collect();
        let (x, y) = self.spawner.select(&self.map, &live, &mut self.rng);

        let player = self.players.get_mut(&session)?;
        if !player.spawn(x, y, self.config.invincibility_seconds) {
            return None;
        }
        info!("Spawned player {} ({}) at ({:.0}, {:.0})", session, player.name, x, y);
        Some((x, y))
    }

    pub fn join_failed(&mut self, session: u32) {
        if let Some(player) = self.players.get_mut(&session) {
            player.fail_join();
        }
    }

    pub fn remove_player(&mut self, session: u32) -> Option<Player> {
        let removed = self.players.remove(&session);
        if removed.is_some() {
            info!("Removed player {}", session);
        }
        removed
    }

    pub fn player(&self, session: u32) -> Option<&Player> {
        self.players.get(&session)
    }

    pub fn live_count(&self) -> usize {
        self.players.values().filter(|p| p.is_alive()).count()
    }

    /// Applies one client input to a live player
    ///
    /// Inputs for unknown or non-live players are dropped. Rate and float
    /// violations drop the input and are returned; movement violations are
    /// clamped and the input still applies.
    pub fn apply_input(
        &mut self,
        session: u32,
        input: &InputState,
    ) -> Result<Option<GameEvent>, CheatViolation> {
        let Some(player) = self.players.get_mut(&session) else {
            return Ok(None);
        };
        if !player.is_alive() {
            return Ok(None);
        }

        if let Err(violation) = self.gate.admit(player.last_input_time, input) {
            player.violations += 1;
            debug!("Dropped input {} from player {}: {}", input.sequence, session, violation);
            return Err(violation);
        }
        player.last_input_time = Some(input.timestamp);

        player.angle = aim_angle(player.x, player.y, input.aim_x, input.aim_y);

        let (vx, vy) = velocity(input.keys, MOVE_SPEED);
        let gated = self
            .gate
            .clamp_displacement(vx * self.config.tick_dt, vy * self.config.tick_dt);
        if let Some(violation) = &gated.violation {
            player.violations += 1;
            warn!("Player {}: {}", session, violation);
        }

        let step = integrate(&self.map, player.x, player.y, gated.dx, gated.dy);
        if step.clamped_to_bounds {
            player.violations += 1;
            warn!("Player {}: {}", session, CheatViolation::OutOfBounds);
        }
        player.x = step.x;
        player.y = step.y;

        if !input.shoot {
            return Ok(None);
        }
        let ready = player
            .last_shot
            .map_or(true, |t| self.time - t >= self.config.shoot_cooldown as f64);
        if !ready {
            debug!("Player {} shot during cooldown", session);
            return Ok(None);
        }
        player.last_shot = Some(self.time);

        let (sin, cos) = player.angle.sin_cos();
        let bullet = Bullet {
            id: self.next_bullet_id,
            owner: session,
            x: player.x + cos * MUZZLE_OFFSET,
            y: player.y + sin * MUZZLE_OFFSET,
            vx: cos * self.config.bullet_speed,
            vy: sin * self.config.bullet_speed,
            lifetime: self.config.bullet_lifetime,
        };
        self.next_bullet_id = self.next_bullet_id.wrapping_add(1);
        self.bullets.push(bullet);

        Ok(Some(GameEvent::BulletFired { owner: session }))
    }

    /// Number of bullet sub-steps needed so a bullet can never skip over the
    /// thinnest obstacle or through a tank
    pub fn required_substeps(&self, dt: f32) -> u32 {
        let max_step = (self.map.min_dimension() / 2.0).min(self.config.hit_radius);
        let travel = self.config.bullet_speed * dt;

        if max_step.is_finite() && max_step > 0.0 && travel > max_step {
            (travel / max_step).ceil() as u32
        } else {
            1
        }
    }

    /// Advances the world by one tick
    ///
    /// Bullets move and collide first, then invincibility runs down, then
    /// players eliminated this tick are removed.
    pub fn update(&mut self, dt: f32, ledger: &Ledger) -> Vec<GameEvent> {
        self.tick = self.tick.wrapping_add(1);
        self.time += dt as f64;

        let mut events = Vec::new();
        self.update_bullets(dt, ledger, &mut events);

        for player in self.players.values_mut() {
            player.tick_invincibility(dt);
        }

        self.players.retain(|_, p| p.phase != Lifecycle::Dead);

        events
    }

    fn update_bullets(&mut self, dt: f32, ledger: &Ledger, events: &mut Vec<GameEvent>) {
        let substeps = self.required_substeps(dt);
        let step_dt = dt / substeps as f32;
        let bullet_box = BULLET_SIZE * 2.0;

        let bullets = std::mem::take(&mut self.bullets);
        let mut survivors = Vec::with_capacity(bullets.len());

        'bullets: for mut bullet in bullets {
            for _ in 0..substeps {
                bullet.x += bullet.vx * step_dt;
                bullet.y += bullet.vy * step_dt;
                bullet.lifetime -= step_dt;

                if bullet.lifetime <= 0.0 || self.map.is_out_of_bounds(bullet.x, bullet.y) {
                    events.push(GameEvent::BulletImpact {
                        x: bullet.x,
                        y: bullet.y,
                        kind: ImpactKind::Border,
                    });
                    continue 'bullets;
                }

                if self.map.collides(bullet.x, bullet.y, bullet_box) {
                    events.push(GameEvent::BulletImpact {
                        x: bullet.x,
                        y: bullet.y,
                        kind: ImpactKind::Wall,
                    });
                    continue 'bullets;
                }

                if let Some(target) = self.find_target(&bullet) {
                    let shielded = self
                        .players
                        .get(&target)
                        .map_or(false, |p| p.is_invincible());
                    if shielded {
                        events.push(GameEvent::BulletImpact {
                            x: bullet.x,
                            y: bullet.y,
                            kind: ImpactKind::Shield,
                        });
                    } else {
                        self.resolve_kill(target, bullet.owner, ledger, events);
                    }
                    continue 'bullets;
                }
            }
            survivors.push(bullet);
        }

        self.bullets = survivors;
    }

    /// Closest live non-owner tank within hit range of the bullet
    fn find_target(&self, bullet: &Bullet) -> Option<u32> {
        self.players
            .values()
            .filter(|p| p.is_alive() && p.id != bullet.owner)
            .map(|p| (p.id, (bullet.x - p.x).hypot(bullet.y - p.y)))
            .filter(|(_, d)| *d < self.config.hit_radius)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    fn resolve_kill(
        &mut self,
        victim_id: u32,
        owner: u32,
        ledger: &Ledger,
        events: &mut Vec<GameEvent>,
    ) {
        let Some(victim) = self.players.get(&victim_id) else {
            return;
        };
        let victim_user = victim.user_id.clone();
        let (x, y) = (victim.x, victim.y);

        let killer = self
            .players
            .get(&owner)
            .filter(|p| p.is_alive())
            .map(|p| {
                let info = KillerInfo {
                    id: p.id,
                    name: p.name.clone(),
                    color: p.color,
                };
                (p.user_id.clone(), info)
            });

        let settlement = match ledger.kill_transfer(
            (victim_user.as_str(), victim_id),
            killer.as_ref().map(|(user, info)| (user.as_str(), info.id)),
        ) {
            Ok(settlement) => settlement,
            Err(e) => {
                warn!("Kill of player {} by {} abandoned: {}", victim_id, owner, e);
                events.push(GameEvent::KillAbandoned {
                    victim: victim_id,
                    killer: killer.map(|(_, info)| info.id),
                });
                return;
            }
        };

        if let Some(victim) = self.players.get_mut(&victim_id) {
            if victim.eliminate() {
                self.deaths.insert(victim_user.clone(), victim.deaths);
            }
        }
        if let Some((_, info)) = &killer {
            if let Some(k) = self.players.get_mut(&info.id) {
                k.kills += 1;
            }
        }

        info!(
            "Player {} eliminated by {:?} (transferred {}, forfeited {})",
            victim_id,
            killer.as_ref().map(|(_, info)| info.id),
            settlement.transferred,
            settlement.forfeited
        );

        events.push(GameEvent::PlayerKilled(KillReport {
            victim: victim_id,
            victim_user,
            killer: killer.map(|(_, info)| info),
            x,
            y,
            settlement,
        }));
    }

    /// Live players and bullets as sent to clients
    pub fn snapshot(&self, ledger: &Ledger) -> (Vec<PlayerState>, Vec<BulletState>) {
        let mut players: Vec<PlayerState> = self
            .players
            .values()
            .filter(|p| p.is_alive())
            .map(|p| {
                let pot = ledger
                    .session_stake(&p.user_id, p.id)
                    .map_or(0, |s| s.pot);
                p.to_state(pot)
            })
            .collect();
        players.sort_by_key(|p| p.id);

        let bullets = self
            .bullets
            .iter()
            .map(|b| BulletState {
                id: b.id,
                owner: b.owner,
                x: b.x,
                y: b.y,
            })
            .collect();

        (players, bullets)
    }

    /// Live players ranked by kills
    pub fn scoreboard(&self) -> Vec<ScoreEntry> {
        let mut entries: Vec<ScoreEntry> = self
            .players
            .values()
            .filter(|p| p.is_alive())
            .map(|p| ScoreEntry {
                id: p.id,
                name: p.name.clone(),
                kills: p.kills,
                deaths: p.deaths,
            })
            .collect();
        entries.sort_by(|a, b| b.kills.cmp(&a.kills).then(a.id.cmp(&b.id)));
        entries
    }

    pub fn stats(&self, ledger: &Ledger) -> GameStats {
        GameStats {
            players: self.live_count(),
            bullets: self.bullets.len(),
            width: self.map.width,
            height: self.map.height,
            forfeited: ledger.forfeited_total(),
        }
    }
}
