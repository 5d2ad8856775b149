use crate::game::{ClientGameState, Features};
use crate::input::InputManager;
use crate::rendering::{HudInfo, Renderer};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use macroquad::prelude::{get_frame_time, is_key_down, next_frame, KeyCode};
use shared::{now_millis, ImpactKind, Packet, ScoreEntry, UserId};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Largest datagram accepted from the server
const RECV_BUFFER_SIZE: usize = 65_536;
const PING_INTERVAL_MS: u64 = 1000;
/// Impact markers kept for drawing
const MAX_IMPACTS: usize = 32;

/// Channel ends connecting the render loop to the socket thread
pub struct NetworkHandle {
    outgoing: mpsc::UnboundedSender<Packet>,
    incoming: mpsc::UnboundedReceiver<Packet>,
}

impl NetworkHandle {
    pub fn send(&self, packet: Packet) {
        if self.outgoing.send(packet).is_err() {
            warn!("Network thread has stopped, packet dropped");
        }
    }

    /// Next packet from the server, if one has arrived
    pub fn try_recv(&mut self) -> Option<Packet> {
        self.incoming.try_recv().ok()
    }
}

/// Starts a background thread that owns the UDP socket
///
/// `fake_ping_ms` delays each direction by half the given amount.
pub fn spawn_network(server_addr: SocketAddr, fake_ping_ms: u64) -> std::io::Result<NetworkHandle> {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("network".into())
        .spawn(move || {
            runtime.block_on(async move {
                if let Err(e) = socket_loop(server_addr, fake_ping_ms, out_rx, in_tx).await {
                    error!("Network thread failed: {}", e);
                }
            });
        })?;

    Ok(NetworkHandle {
        outgoing: out_tx,
        incoming: in_rx,
    })
}

async fn socket_loop(
    server_addr: SocketAddr,
    fake_ping_ms: u64,
    mut outgoing: mpsc::UnboundedReceiver<Packet>,
    incoming: mpsc::UnboundedSender<Packet>,
) -> Result<(), Box<dyn std::error::Error>> {
    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    info!("Bound {} for server {}", socket.local_addr()?, server_addr);
    let delay = Duration::from_millis(fake_ping_ms / 2);
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buffer) => {
                match result {
                    Ok((len, addr)) if addr == server_addr => {
                        let packet = match deserialize::<Packet>(&buffer[..len]) {
                            Ok(packet) => packet,
                            Err(e) => {
                                debug!("Dropped malformed packet: {}", e);
                                continue;
                            }
                        };
                        if delay.is_zero() {
                            if incoming.send(packet).is_err() {
                                return Ok(());
                            }
                        } else {
                            let incoming = incoming.clone();
                            tokio::spawn(async move {
                                sleep(delay).await;
                                let _ = incoming.send(packet);
                            });
                        }
                    }
                    Ok((_, addr)) => debug!("Ignored datagram from {}", addr),
                    Err(e) => error!("Error receiving packet: {}", e),
                }
            }

            packet = outgoing.recv() => {
                let Some(packet) = packet else {
                    return Ok(());
                };
                let data = serialize(&packet)?;
                if delay.is_zero() {
                    socket.send_to(&data, server_addr).await?;
                } else {
                    let socket = Arc::clone(&socket);
                    tokio::spawn(async move {
                        sleep(delay).await;
                        if let Err(e) = socket.send_to(&data, server_addr).await {
                            error!("Failed to send packet: {}", e);
                        }
                    });
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for the server to answer the first join
    Connecting,
    Menu,
    Joining,
    InGame,
    Dead,
    Disconnected(String),
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Connecting => write!(f, "Connecting"),
            SessionPhase::Menu => write!(f, "Menu"),
            SessionPhase::Joining => write!(f, "Joining"),
            SessionPhase::InGame => write!(f, "In game"),
            SessionPhase::Dead => write!(f, "Eliminated"),
            SessionPhase::Disconnected(reason) => write!(f, "Disconnected: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeathNotice {
    pub killer_name: Option<String>,
    pub killer_color: Option<u32>,
    pub x: f32,
    pub y: f32,
}

/// Client view of its session: identity, wallet and what the server last said
pub struct Session {
    user_id: UserId,
    name: String,
    color: u32,
    client_id: Option<u32>,
    phase: SessionPhase,
    wallet_balance: Option<u64>,
    pot: u64,
    kills: u32,
    last_failure: Option<String>,
    last_death: Option<DeathNotice>,
    scoreboard: Vec<ScoreEntry>,
    impacts: VecDeque<(f32, f32, ImpactKind)>,
}

impl Session {
    pub fn new(user_id: UserId, name: String, color: u32) -> Self {
        Self {
            user_id,
            name,
            color,
            client_id: None,
            phase: SessionPhase::Connecting,
            wallet_balance: None,
            pot: 0,
            kills: 0,
            last_failure: None,
            last_death: None,
            scoreboard: Vec::new(),
            impacts: VecDeque::new(),
        }
    }

    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn wallet_balance(&self) -> Option<u64> {
        self.wallet_balance
    }

    pub fn pot(&self) -> u64 {
        self.pot
    }

    pub fn kills(&self) -> u32 {
        self.kills
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn last_death(&self) -> Option<&DeathNotice> {
        self.last_death.as_ref()
    }

    pub fn scoreboard(&self) -> &[ScoreEntry] {
        &self.scoreboard
    }

    pub fn impacts(&self) -> impl Iterator<Item = &(f32, f32, ImpactKind)> {
        self.impacts.iter()
    }

    pub fn is_in_game(&self) -> bool {
        self.phase == SessionPhase::InGame
    }

    /// Join request, or `None` if the current phase does not allow one
    pub fn request_join(&mut self) -> Option<Packet> {
        match self.phase {
            SessionPhase::Connecting
            | SessionPhase::Menu
            | SessionPhase::Dead
            | SessionPhase::Disconnected(_) => {
                // Without a client id the server answers with a fresh welcome first
                self.phase = if self.client_id.is_some() {
                    SessionPhase::Joining
                } else {
                    SessionPhase::Connecting
                };
                self.last_failure = None;
                Some(Packet::Join {
                    user_id: self.user_id.clone(),
                    name: self.name.clone(),
                    color: self.color,
                })
            }
            _ => None,
        }
    }

    pub fn request_cash_out(&self) -> Option<Packet> {
        self.is_in_game().then_some(Packet::CashOut)
    }

    /// Leaves the arena and goes back to the menu
    pub fn quit(&mut self, game: &mut ClientGameState) -> Option<Packet> {
        if self.client_id.is_none() {
            return None;
        }
        self.phase = SessionPhase::Menu;
        self.pot = 0;
        game.reset();
        Some(Packet::Quit)
    }

    fn record_impact(&mut self, x: f32, y: f32, kind: ImpactKind) {
        self.impacts.push_back((x, y, kind));
        while self.impacts.len() > MAX_IMPACTS {
            self.impacts.pop_front();
        }
    }

    /// Applies one server packet; returns packets that should be sent in response
    pub fn handle_packet(
        &mut self,
        packet: Packet,
        game: &mut ClientGameState,
        now: u64,
    ) -> Vec<Packet> {
        let mut replies = Vec::new();

        match packet {
            Packet::Welcome { client_id, map } => {
                info!("Connected! Client ID: {}", client_id);
                self.client_id = Some(client_id);
                game.set_map(map);
                game.set_local_id(client_id);
                self.phase = SessionPhase::Joining;
            }

            Packet::JoinSucceeded {
                wallet_balance,
                pot,
            } => {
                info!("Joined the arena, wallet {} pot {}", wallet_balance, pot);
                self.wallet_balance = Some(wallet_balance);
                self.pot = pot;
                self.kills = 0;
                self.last_death = None;
                self.last_failure = None;
                self.phase = SessionPhase::InGame;
            }

            Packet::JoinFailed { reason } => {
                warn!("Join failed: {}", reason);
                self.last_failure = Some(reason.to_string());
                self.phase = SessionPhase::Menu;
            }

            Packet::CashOutResult {
                reason,
                cashed_out,
                wallet_balance,
                pot,
            } => {
                self.wallet_balance = Some(wallet_balance);
                self.pot = pot;
                match reason {
                    None => {
                        info!("Cashed out {}, wallet now {}", cashed_out, wallet_balance);
                        replies.extend(self.quit(game));
                    }
                    Some(reason) => {
                        warn!("Cash-out failed: {}", reason);
                        self.last_failure = Some(reason.to_string());
                    }
                }
            }

            Packet::State {
                tick,
                players,
                bullets,
                ..
            } => {
                game.apply_server_state(now, tick, players, bullets);
            }

            Packet::Hit { killer_id } => {
                debug!("Hit by {:?}", killer_id);
                self.phase = SessionPhase::Dead;
                self.pot = 0;
            }

            Packet::HitConfirmed { target_id } => {
                debug!("Eliminated player {}", target_id);
                self.kills += 1;
            }

            Packet::Death {
                victim_id,
                killer_name,
                killer_color,
                x,
                y,
                ..
            } => {
                if Some(victim_id) == self.client_id {
                    self.phase = SessionPhase::Dead;
                    self.last_death = Some(DeathNotice {
                        killer_name,
                        killer_color,
                        x,
                        y,
                    });
                }
            }

            Packet::PotUpdate {
                wallet_balance,
                pot,
            } => {
                self.wallet_balance = Some(wallet_balance);
                self.pot = pot;
            }

            Packet::BulletFired => {}

            Packet::BulletImpact { x, y, kind } => self.record_impact(x, y, kind),

            Packet::Scoreboard { entries } => self.scoreboard = entries,

            Packet::ForceDisconnect { reason } | Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.client_id = None;
                self.pot = 0;
                game.reset();
                self.phase = SessionPhase::Disconnected(reason);
            }

            Packet::Pong { timestamp } => {
                game.update_rtt(now.saturating_sub(timestamp));
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }

        replies
    }
}

pub struct Client {
    network: NetworkHandle,
    session: Session,
    game_state: ClientGameState,
    input_manager: InputManager,
    renderer: Renderer,
    features: Features,
    fake_ping_ms: u64,
    last_ping: u64,
}

impl Client {
    pub fn new(
        network: NetworkHandle,
        session: Session,
        fake_ping_ms: u64,
        width: usize,
        height: usize,
    ) -> Self {
        Client {
            network,
            session,
            game_state: ClientGameState::default(),
            input_manager: InputManager::new(),
            renderer: Renderer::new(width, height),
            features: Features::default(),
            fake_ping_ms,
            last_ping: 0,
        }
    }

    fn handle_toggles(&mut self, controls: &crate::input::Controls) {
        if controls.toggle_prediction {
            self.features.prediction = !self.features.prediction;
            info!("Client-side prediction: {}", self.features.prediction);
        }
        if controls.toggle_reconciliation {
            self.features.reconciliation = !self.features.reconciliation;
            info!("Server reconciliation: {}", self.features.reconciliation);
        }
        if controls.toggle_interpolation {
            self.features.interpolation = !self.features.interpolation;
            info!("Interpolation: {}", self.features.interpolation);
        }
    }

    fn drain_network(&mut self, now: u64) {
        while let Some(packet) = self.network.try_recv() {
            for reply in self.session.handle_packet(packet, &mut self.game_state, now) {
                self.network.send(reply);
            }
        }
    }

    pub async fn run(&mut self) {
        if let Some(join) = self.session.request_join() {
            self.network.send(join);
        }

        while !is_key_down(KeyCode::Escape) {
            let now = now_millis();
            self.drain_network(now);

            if now.saturating_sub(self.last_ping) >= PING_INTERVAL_MS {
                self.network.send(Packet::Ping { timestamp: now });
                self.last_ping = now;
            }

            let (controls, frame_input) = self.input_manager.sample(self.renderer.camera());
            self.handle_toggles(&controls);

            if controls.join {
                if let Some(packet) = self.session.request_join() {
                    self.network.send(packet);
                }
            }
            if controls.cash_out {
                if let Some(packet) = self.session.request_cash_out() {
                    self.network.send(packet);
                }
            }
            if controls.quit {
                if let Some(packet) = self.session.quit(&mut self.game_state) {
                    self.network.send(packet);
                }
            }

            let due = self.input_manager.due_inputs(get_frame_time());
            if self.session.is_in_game() {
                for _ in 0..due {
                    let input = self.input_manager.build(&frame_input, now);
                    if self.features.prediction {
                        self.game_state
                            .predict(input.keys, input.aim_x, input.aim_y, shared::TICK_DT);
                    }
                    self.network.send(Packet::Input {
                        sequence: input.sequence,
                        timestamp: input.timestamp,
                        keys: input.keys,
                        aim_x: input.aim_x,
                        aim_y: input.aim_y,
                        shoot: input.shoot,
                    });
                }
            }

            let frame = self.game_state.frame(now, self.features);
            let local = self
                .session
                .client_id()
                .and_then(|id| frame.player(id))
                .map(|p| (p.x, p.y));
            self.renderer.follow(local, self.game_state.map());

            let hud = HudInfo {
                features: self.features,
                ping_ms: self.game_state.rtt_ms(),
                fake_ping_ms: self.fake_ping_ms,
            };
            self.renderer
                .render(&frame, self.game_state.map(), &self.session, &hud);

            next_frame().await;
        }

        if let Some(packet) = self.session.quit(&mut self.game_state) {
            self.network.send(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::map::ObstacleMap;
    use shared::{FailureReason, PlayerState};

    fn session() -> Session {
        Session::new("alice".into(), "Alice".into(), 0x00ff00)
    }

    fn welcome(session: &mut Session, game: &mut ClientGameState) {
        let map = ObstacleMap::new(1000.0, 1000.0, 50.0, Vec::new());
        session.handle_packet(Packet::Welcome { client_id: 4, map }, game, 0);
    }

    fn me(x: f32) -> PlayerState {
        PlayerState {
            id: 4,
            name: "Alice".into(),
            color: 0,
            x,
            y: 500.0,
            angle: 0.0,
            kills: 0,
            deaths: 0,
            invincible: true,
            pot: 100,
        }
    }

    #[test]
    fn test_first_join_packet() {
        let mut s = session();
        match s.request_join() {
            Some(Packet::Join {
                user_id,
                name,
                color,
            }) => {
                assert_eq!(user_id, "alice");
                assert_eq!(name, "Alice");
                assert_eq!(color, 0x00ff00);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
        assert_eq!(s.phase(), &SessionPhase::Connecting);
    }

    #[test]
    fn test_join_flow() {
        let mut s = session();
        let mut game = ClientGameState::default();
        welcome(&mut s, &mut game);
        assert_eq!(s.client_id(), Some(4));
        assert_eq!(game.local_id(), Some(4));
        assert!(game.map().is_some());
        assert!(s.request_join().is_none());

        s.handle_packet(
            Packet::JoinSucceeded {
                wallet_balance: 900,
                pot: 100,
            },
            &mut game,
            0,
        );
        assert!(s.is_in_game());
        assert_eq!(s.wallet_balance(), Some(900));
        assert!(matches!(s.request_cash_out(), Some(Packet::CashOut)));
    }

    #[test]
    fn test_join_failure_keeps_reason() {
        let mut s = session();
        let mut game = ClientGameState::default();
        welcome(&mut s, &mut game);
        s.handle_packet(
            Packet::JoinFailed {
                reason: FailureReason::InsufficientFunds {
                    balance: 40,
                    required: 100,
                },
            },
            &mut game,
            0,
        );
        assert_eq!(s.phase(), &SessionPhase::Menu);
        assert!(s.last_failure().unwrap().contains("40"));
        assert!(s.request_join().is_some());
        assert_eq!(s.phase(), &SessionPhase::Joining);
    }

    #[test]
    fn test_successful_cash_out_quits() {
        let mut s = session();
        let mut game = ClientGameState::default();
        welcome(&mut s, &mut game);
        s.handle_packet(Packet::JoinSucceeded { wallet_balance: 900, pot: 100 }, &mut game, 0);

        let replies = s.handle_packet(
            Packet::CashOutResult {
                reason: None,
                cashed_out: 300,
                wallet_balance: 1200,
                pot: 0,
            },
            &mut game,
            0,
        );
        assert!(matches!(replies.as_slice(), [Packet::Quit]));
        assert_eq!(s.phase(), &SessionPhase::Menu);
        assert_eq!(s.wallet_balance(), Some(1200));
        assert_eq!(s.pot(), 0);
    }

    #[test]
    fn test_failed_cash_out_stays_in_game() {
        let mut s = session();
        let mut game = ClientGameState::default();
        welcome(&mut s, &mut game);
        s.handle_packet(Packet::JoinSucceeded { wallet_balance: 900, pot: 100 }, &mut game, 0);

        let replies = s.handle_packet(
            Packet::CashOutResult {
                reason: Some(FailureReason::Busy),
                cashed_out: 0,
                wallet_balance: 900,
                pot: 100,
            },
            &mut game,
            0,
        );
        assert!(replies.is_empty());
        assert!(s.is_in_game());
        assert!(s.last_failure().is_some());
    }

    #[test]
    fn test_death_and_pot_updates() {
        let mut s = session();
        let mut game = ClientGameState::default();
        welcome(&mut s, &mut game);
        s.handle_packet(Packet::JoinSucceeded { wallet_balance: 900, pot: 100 }, &mut game, 0);

        s.handle_packet(Packet::HitConfirmed { target_id: 9 }, &mut game, 0);
        s.handle_packet(Packet::PotUpdate { wallet_balance: 900, pot: 200 }, &mut game, 0);
        assert_eq!((s.kills(), s.pot()), (1, 200));

        s.handle_packet(Packet::Hit { killer_id: Some(9) }, &mut game, 0);
        s.handle_packet(
            Packet::Death {
                victim_id: 4,
                killer_id: Some(9),
                killer_name: Some("Bob".into()),
                killer_color: Some(0xff0000),
                x: 10.0,
                y: 20.0,
            },
            &mut game,
            0,
        );
        assert_eq!(s.phase(), &SessionPhase::Dead);
        assert_eq!(s.pot(), 0);
        assert_eq!(s.last_death().unwrap().killer_name.as_deref(), Some("Bob"));
        assert!(s.request_join().is_some());
    }

    #[test]
    fn test_state_and_pong_feed_game() {
        let mut s = session();
        let mut game = ClientGameState::default();
        welcome(&mut s, &mut game);

        s.handle_packet(
            Packet::State {
                tick: 1,
                timestamp: 0,
                players: vec![me(300.0)],
                bullets: Vec::new(),
            },
            &mut game,
            1000,
        );
        assert_eq!(game.buffered(), 1);
        assert_eq!(game.predicted().unwrap().x, 300.0);

        s.handle_packet(Packet::Pong { timestamp: 1000 }, &mut game, 1300);
        assert_eq!(game.rtt_ms(), Some(300));
        assert_eq!(game.interpolation_delay(), 150);
    }

    #[test]
    fn test_force_disconnect() {
        let mut s = session();
        let mut game = ClientGameState::default();
        welcome(&mut s, &mut game);
        s.handle_packet(
            Packet::ForceDisconnect {
                reason: "Signed in from another session".into(),
            },
            &mut game,
            0,
        );
        assert!(matches!(s.phase(), SessionPhase::Disconnected(_)));
        assert!(s.client_id().is_none());
        assert!(s.quit(&mut game).is_none());
    }

    #[test]
    fn test_impacts_are_bounded() {
        let mut s = session();
        let mut game = ClientGameState::default();
        for i in 0..(MAX_IMPACTS + 5) {
            s.handle_packet(
                Packet::BulletImpact {
                    x: i as f32,
                    y: 0.0,
                    kind: ImpactKind::Wall,
                },
                &mut game,
                0,
            );
        }
        assert_eq!(s.impacts().count(), MAX_IMPACTS);
        assert_eq!(s.impacts().next().unwrap().0, 5.0);
    }
}
