//! Server network layer: UDP transport, session handling and the tick loop
//!
//! The main loop owns the simulation. Receiver, sender and timeout tasks talk
//! to it over channels, and wallet operations run as spawned tasks that report
//! back through the same channel, so the world is never touched concurrently.

use crate::client_manager::{Client, ClientManager};
use crate::game::{GameEvent, GameState, KillReport};
use crate::ledger::{CashOut, Ledger, LedgerError, Stake};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{FailureReason, InputState, Packet, UserId, TICK_RATE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};

/// Largest datagram accepted from a client
const RECV_BUFFER_SIZE: usize = 4096;

/// Messages sent from network and ledger tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ClientTimeout {
        client: Client,
    },
    LedgerCompleted {
        client_id: u32,
        user_id: UserId,
        outcome: LedgerOutcome,
    },
    Shutdown,
}

#[derive(Debug)]
pub enum LedgerOutcome {
    Join(Result<Stake, LedgerError>),
    CashOut(Result<CashOut, LedgerError>),
    /// Stake returned for a session that left while its join was in flight
    Refund(Result<CashOut, LedgerError>),
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum GameMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<u32>,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    /// How often game statistics are logged
    pub stats_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: TICK_RATE,
            max_clients: 32,
            stats_interval: Duration::from_secs(10),
        }
    }
}

/// Removes every other session that joined with `user`
///
/// Each evicted session loses its player and its ledger account. Returns the
/// evicted sessions so they can be told why.
pub fn evict_identity(
    clients: &mut ClientManager,
    game: &mut GameState,
    ledger: &Ledger,
    user: &str,
    keep: u32,
) -> Vec<(u32, SocketAddr)> {
    clients
        .find_by_user(user, keep)
        .into_iter()
        .filter_map(|id| {
            let client = clients.remove_client(&id)?;
            if let Some(player) = game.remove_player(id) {
                ledger.close_account(&player.user_id, id);
            }
            warn!("Evicted session {} of {} in favour of session {}", id, user, keep);
            Some((id, client.addr))
        })
        .collect()
}

pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    game_state: GameState,
    ledger: Arc<Ledger>,
    config: ServerConfig,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        config: ServerConfig,
        game_state: GameState,
        ledger: Arc<Ledger>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
            game_state,
            ledger,
            config,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender that can be used to stop the server with [`ServerMessage::Shutdown`]
    pub fn control(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; RECV_BUFFER_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match deserialize::<Packet>(&buffer[..len]) {
                        Ok(packet) => {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => debug!("Dropped malformed packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::BroadcastPacket { packet, exclude } => {
                        let data = match serialize(&packet) {
                            Ok(data) => data,
                            Err(e) => {
                                error!("Failed to serialize broadcast: {}", e);
                                continue;
                            }
                        };
                        let client_addrs = clients.read().await.get_client_addrs();

                        for (client_id, addr) in client_addrs {
                            if Some(client_id) == exclude {
                                continue;
                            }
                            if let Err(e) = socket.send_to(&data, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = clients.write().await.check_timeouts();
                for client in timed_out {
                    if server_tx.send(ServerMessage::ClientTimeout { client }).is_err() {
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    async fn send_to_client(&self, client_id: u32, packet: Packet) {
        let addr = self.clients.read().await.addr_of(client_id);
        match addr {
            Some(addr) => self.send_packet(packet, addr),
            None => debug!("Client {} gone, dropping {:?}", client_id, packet),
        }
    }

    fn broadcast_packet(&self, packet: Packet, exclude: Option<u32>) {
        if let Err(e) = self.game_tx.send(GameMessage::BroadcastPacket { packet, exclude }) {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    fn broadcast_scoreboard(&self) {
        let entries = self.game_state.scoreboard();
        self.broadcast_packet(Packet::Scoreboard { entries }, None);
    }

    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        let client_id = {
            let mut clients = self.clients.write().await;
            let id = clients.find_client_by_addr(addr);
            if let Some(id) = id {
                clients.touch(id);
            }
            id
        };

        match packet {
            Packet::Join {
                user_id,
                name,
                color,
            } => self.handle_join(client_id, addr, user_id, name, color).await,

            Packet::Input {
                sequence,
                timestamp,
                keys,
                aim_x,
                aim_y,
                shoot,
            } => {
                if let Some(client_id) = client_id {
                    let input = InputState {
                        sequence,
                        timestamp,
                        keys,
                        aim_x,
                        aim_y,
                        shoot,
                    };
                    self.clients.write().await.add_input(client_id, input);
                }
            }

            Packet::CashOut => {
                let Some(client_id) = client_id else {
                    return;
                };
                let user = self.game_state.player(client_id).map(|p| p.user_id.clone());
                match user {
                    Some(user) => self.spawn_cash_out(client_id, user),
                    None => self.send_packet(
                        Packet::CashOutResult {
                            reason: Some(FailureReason::NotInGame),
                            cashed_out: 0,
                            wallet_balance: 0,
                            pot: 0,
                        },
                        addr,
                    ),
                }
            }

            Packet::Quit => {
                if let Some(client_id) = client_id {
                    self.end_game(client_id);
                }
            }

            Packet::Ping { timestamp } => {
                self.send_packet(Packet::Pong { timestamp }, addr);
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn handle_join(
        &mut self,
        client_id: Option<u32>,
        addr: SocketAddr,
        user_id: UserId,
        name: String,
        color: u32,
    ) {
        let client_id = match client_id {
            Some(id) => id,
            None => {
                let added = self.clients.write().await.add_client(addr);
                match added {
                    Some(id) => {
                        let map = self.game_state.map().clone();
                        self.send_packet(Packet::Welcome { client_id: id, map }, addr);
                        id
                    }
                    None => {
                        self.send_packet(
                            Packet::Disconnected {
                                reason: "Server full".to_string(),
                            },
                            addr,
                        );
                        return;
                    }
                }
            }
        };

        let user_id = user_id.trim().to_string();
        if user_id.is_empty() {
            self.send_packet(
                Packet::JoinFailed {
                    reason: FailureReason::MissingIdentity,
                },
                addr,
            );
            return;
        }

        // Nothing about the session or other identities changes until the
        // join request itself is accepted
        let name = if name.trim().is_empty() {
            format!("Tank {}", client_id)
        } else {
            name
        };
        if let Err(reason) = self
            .game_state
            .begin_join(client_id, user_id.clone(), name, color)
        {
            self.send_packet(Packet::JoinFailed { reason }, addr);
            return;
        }

        let evicted = {
            let mut clients = self.clients.write().await;
            clients.set_identity(client_id, user_id.clone());
            evict_identity(
                &mut clients,
                &mut self.game_state,
                &self.ledger,
                &user_id,
                client_id,
            )
        };
        for (_, evicted_addr) in &evicted {
            self.send_packet(
                Packet::ForceDisconnect {
                    reason: "Signed in from another session".to_string(),
                },
                *evicted_addr,
            );
        }
        if !evicted.is_empty() {
            self.broadcast_scoreboard();
        }

        let ledger = Arc::clone(&self.ledger);
        let tx = self.server_tx.clone();
        tokio::spawn(async move {
            let outcome = LedgerOutcome::Join(ledger.join(&user_id, client_id).await);
            let _ = tx.send(ServerMessage::LedgerCompleted {
                client_id,
                user_id,
                outcome,
            });
        });
    }

    fn spawn_cash_out(&self, client_id: u32, user_id: UserId) {
        let ledger = Arc::clone(&self.ledger);
        let tx = self.server_tx.clone();
        tokio::spawn(async move {
            let outcome = LedgerOutcome::CashOut(ledger.cash_out(&user_id, client_id).await);
            let _ = tx.send(ServerMessage::LedgerCompleted {
                client_id,
                user_id,
                outcome,
            });
        });
    }

    /// Returns the stake of a session that left while its join was in flight
    fn spawn_refund(&self, client_id: u32, user_id: UserId) {
        let ledger = Arc::clone(&self.ledger);
        let tx = self.server_tx.clone();
        tokio::spawn(async move {
            let result = ledger.cash_out(&user_id, client_id).await;
            ledger.close_account(&user_id, client_id);
            let _ = tx.send(ServerMessage::LedgerCompleted {
                client_id,
                user_id,
                outcome: LedgerOutcome::Refund(result),
            });
        });
    }

    /// Takes a session's player out of the arena and closes its ledger account
    fn end_game(&mut self, client_id: u32) {
        if let Some(player) = self.game_state.remove_player(client_id) {
            self.ledger.close_account(&player.user_id, client_id);
            self.broadcast_scoreboard();
        }
    }

    async fn handle_ledger_completed(
        &mut self,
        client_id: u32,
        user_id: UserId,
        outcome: LedgerOutcome,
    ) {
        match outcome {
            LedgerOutcome::Join(Ok(stake)) => {
                if self.game_state.spawn_player(client_id).is_none() {
                    info!("Session {} left during join, refunding {}", client_id, user_id);
                    self.spawn_refund(client_id, user_id);
                    return;
                }
                self.send_to_client(
                    client_id,
                    Packet::JoinSucceeded {
                        wallet_balance: stake.wallet_balance,
                        pot: stake.pot,
                    },
                )
                .await;
                self.send_to_client(client_id, pot_update(stake)).await;
                self.broadcast_scoreboard();
            }
            LedgerOutcome::Join(Err(e)) => {
                warn!("Join failed for {} (session {}): {}", user_id, client_id, e);
                self.game_state.join_failed(client_id);
                self.send_to_client(
                    client_id,
                    Packet::JoinFailed {
                        reason: FailureReason::from(&e),
                    },
                )
                .await;
            }
            LedgerOutcome::CashOut(result) => {
                let packet = match result {
                    Ok(cash_out) => {
                        self.send_to_client(client_id, pot_update(cash_out.stake)).await;
                        Packet::CashOutResult {
                            reason: None,
                            cashed_out: cash_out.cashed_out,
                            wallet_balance: cash_out.stake.wallet_balance,
                            pot: cash_out.stake.pot,
                        }
                    }
                    Err(e) => {
                        warn!("Cash-out failed for {} (session {}): {}", user_id, client_id, e);
                        let stake = self
                            .ledger
                            .session_stake(&user_id, client_id)
                            .unwrap_or_default();
                        Packet::CashOutResult {
                            reason: Some(FailureReason::from(&e)),
                            cashed_out: 0,
                            wallet_balance: stake.wallet_balance,
                            pot: stake.pot,
                        }
                    }
                };
                self.send_to_client(client_id, packet).await;
            }
            LedgerOutcome::Refund(Ok(cash_out)) => {
                info!("Refunded {} to {}", cash_out.cashed_out, user_id);
            }
            LedgerOutcome::Refund(Err(LedgerError::NotInGame)) => {
                info!("Stake of {} (session {}) already returned", user_id, client_id);
            }
            LedgerOutcome::Refund(Err(e)) => {
                warn!("Refund for {} (session {}) failed: {}", user_id, client_id, e);
            }
        }
    }

    /// Applies every queued input in client timestamp order
    async fn process_inputs(&mut self) {
        let inputs = self.clients.read().await.get_chronological_inputs();
        if inputs.is_empty() {
            return;
        }

        let mut events = Vec::new();
        for (client_id, input) in &inputs {
            if let Ok(Some(event)) = self.game_state.apply_input(*client_id, input) {
                events.push(event);
            }
        }

        {
            let mut clients = self.clients.write().await;
            for (client_id, input) in &inputs {
                clients.mark_input_processed(*client_id, input.sequence);
            }
            clients.cleanup_processed_inputs();
        }

        self.dispatch_events(events).await;
    }

    async fn dispatch_events(&mut self, events: Vec<GameEvent>) {
        let mut scoreboard_dirty = false;

        for event in events {
            match event {
                GameEvent::BulletFired { owner } => {
                    self.send_to_client(owner, Packet::BulletFired).await;
                }
                GameEvent::BulletImpact { x, y, kind } => {
                    self.broadcast_packet(Packet::BulletImpact { x, y, kind }, None);
                }
                GameEvent::PlayerKilled(report) => {
                    self.notify_kill(report).await;
                    scoreboard_dirty = true;
                }
                GameEvent::KillAbandoned { .. } => {}
            }
        }

        if scoreboard_dirty {
            self.broadcast_scoreboard();
        }
    }

    async fn notify_kill(&self, report: KillReport) {
        let killer_id = report.killer.as_ref().map(|k| k.id);

        self.send_to_client(report.victim, Packet::Hit { killer_id }).await;
        if let Some(stake) = report.settlement.victim {
            self.send_to_client(report.victim, pot_update(stake)).await;
        }

        if let Some(killer) = &report.killer {
            self.send_to_client(
                killer.id,
                Packet::HitConfirmed {
                    target_id: report.victim,
                },
            )
            .await;
            if let Some(stake) = report.settlement.killer {
                self.send_to_client(killer.id, pot_update(stake)).await;
            }
        }

        self.broadcast_packet(
            Packet::Death {
                victim_id: report.victim,
                killer_id,
                killer_name: report.killer.as_ref().map(|k| k.name.clone()),
                killer_color: report.killer.as_ref().map(|k| k.color),
                x: report.x,
                y: report.y,
            },
            None,
        );
    }

    fn broadcast_game_state(&self) {
        let (players, bullets) = self.game_state.snapshot(&self.ledger);
        let packet = Packet::State {
            tick: self.game_state.tick,
            timestamp: shared::now_millis(),
            players,
            bullets,
        };
        self.broadcast_packet(packet, None);
    }

    async fn tick(&mut self, dt: f32) {
        self.process_inputs().await;

        let events = self.game_state.update(dt, &self.ledger);
        self.dispatch_events(events).await;

        if !self.clients.read().await.is_empty() {
            self.broadcast_game_state();
        }
    }

    /// Main server loop
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let dt = 1.0 / self.config.tick_rate as f32;
        let mut tick_interval = interval(Duration::from_secs_f32(dt));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let stats_every = (self.config.stats_interval.as_secs_f32() * self.config.tick_rate as f32)
            .max(1.0) as u32;

        info!("Server started at {} Hz", self.config.tick_rate);

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        }
                        Some(ServerMessage::ClientTimeout { client }) => {
                            info!("Client {} timed out", client.id);
                            self.end_game(client.id);
                        }
                        Some(ServerMessage::LedgerCompleted { client_id, user_id, outcome }) => {
                            self.handle_ledger_completed(client_id, user_id, outcome).await;
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                }

                _ = tick_interval.tick() => {
                    self.tick(dt).await;

                    if self.game_state.tick % stats_every == 0 {
                        info!("Stats: {}", self.game_state.stats(&self.ledger));
                    }
                }
            }
        }

        Ok(())
    }
}

fn pot_update(stake: Stake) -> Packet {
    Packet::PotUpdate {
        wallet_balance: stake.wallet_balance,
        pot: stake.pot,
    }
}
