//! Session registry for the arena server
//!
//! Tracks every connected UDP endpoint as a session: its address, the external
//! identity it joined with, liveness, and the inputs it has sent that the next
//! tick has not consumed yet.

use log::{info, warn};
use shared::{InputState, UserId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Sessions silent for longer than this are dropped
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);
/// Inputs buffered per session before the oldest are discarded
pub const MAX_PENDING_INPUTS: usize = 120;

/// One connected endpoint
#[derive(Debug)]
pub struct Client {
    pub id: u32,
    pub addr: SocketAddr,
    /// Identity the session joined with, once it has sent a join
    pub user_id: Option<UserId>,
    pub last_seen: Instant,
    /// Highest input sequence applied by the simulation
    pub last_processed_input: u32,
    pub pending_inputs: Vec<InputState>,
}

impl Client {
    pub fn new(id: u32, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            user_id: None,
            last_seen: Instant::now(),
            last_processed_input: 0,
            pending_inputs: Vec::new(),
        }
    }

    /// Queues an input in sequence order
    ///
    /// Duplicates and inputs older than the last processed one are ignored.
    pub fn add_input(&mut self, input: InputState) {
        self.last_seen = Instant::now();
        if input.sequence <= self.last_processed_input
            || self.pending_inputs.iter().any(|i| i.sequence == input.sequence)
        {
            return;
        }
        self.pending_inputs.push(input);
        self.pending_inputs.sort_by_key(|i| i.sequence);

        if self.pending_inputs.len() > MAX_PENDING_INPUTS {
            let excess = self.pending_inputs.len() - MAX_PENDING_INPUTS;
            self.pending_inputs.drain(..excess);
            warn!("Client {} input queue overflowed, dropped {}", self.id, excess);
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

pub struct ClientManager {
    clients: HashMap<u32, Client>,
    next_client_id: u32,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Registers a new session, or returns `None` at capacity
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, Client::new(client_id, addr));

        Some(client_id)
    }

    pub fn remove_client(&mut self, client_id: &u32) -> Option<Client> {
        let removed = self.clients.remove(client_id);
        if let Some(client) = &removed {
            info!("Client {} disconnected", client.id);
        }
        removed
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    /// Sessions other than `except` that joined with `user`
    pub fn find_by_user(&self, user: &str, except: u32) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .clients
            .values()
            .filter(|c| c.id != except && c.user_id.as_deref() == Some(user))
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn set_identity(&mut self, client_id: u32, user: UserId) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.user_id = Some(user);
                true
            }
            None => false,
        }
    }

    pub fn identity(&self, client_id: u32) -> Option<&str> {
        self.clients.get(&client_id)?.user_id.as_deref()
    }

    pub fn addr_of(&self, client_id: u32) -> Option<SocketAddr> {
        self.clients.get(&client_id).map(|c| c.addr)
    }

    pub fn touch(&mut self, client_id: u32) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.touch();
        }
    }

    pub fn add_input(&mut self, client_id: u32, input: InputState) -> bool {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.add_input(input);
            true
        } else {
            false
        }
    }

    /// All unprocessed inputs across sessions, ordered by client timestamp
    pub fn get_chronological_inputs(&self) -> Vec<(u32, InputState)> {
        let mut all_inputs: Vec<(u32, InputState)> = Vec::new();

        for (client_id, client) in &self.clients {
            for input in &client.pending_inputs {
                if input.sequence > client.last_processed_input {
                    all_inputs.push((*client_id, input.clone()));
                }
            }
        }

        all_inputs.sort_by_key(|(id, input)| (input.timestamp, *id, input.sequence));
        all_inputs
    }

    pub fn mark_input_processed(&mut self, client_id: u32, sequence: u32) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_processed_input = client.last_processed_input.max(sequence);
        }
    }

    pub fn cleanup_processed_inputs(&mut self) {
        for client in self.clients.values_mut() {
            let last = client.last_processed_input;
            client.pending_inputs.retain(|input| input.sequence > last);
        }
    }

    /// Removes sessions silent for longer than [`CLIENT_TIMEOUT`]
    pub fn check_timeouts(&mut self) -> Vec<Client> {
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(CLIENT_TIMEOUT))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .iter()
            .filter_map(|id| self.remove_client(id))
            .collect()
    }

    pub fn get_client_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
