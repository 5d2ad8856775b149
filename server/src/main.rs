use clap::Parser;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use server::game::{GameConfig, GameState};
use server::ledger::{Ledger, MemoryBalanceProvider};
use server::network::{Server, ServerConfig};
use shared::map::ObstacleMap;
use shared::ENTRY_FEE;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Tick rate (updates per second)
    #[clap(short, long, default_value = "60")]
    tick_rate: u32,
    /// Maximum number of connected sessions
    #[clap(short, long, default_value = "32")]
    max_clients: usize,
    /// Stake taken from the wallet on every join
    #[clap(long, default_value_t = ENTRY_FEE)]
    entry_fee: u64,
    /// Balance given to identities the balance provider has not seen yet
    #[clap(long, default_value = "1000")]
    starting_balance: u64,
    /// Artificial delay for every balance provider call, in milliseconds
    #[clap(long, default_value = "0")]
    provider_latency_ms: u64,
    /// Seed for map generation and spawn selection
    #[clap(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    if args.tick_rate == 0 {
        return Err("tick rate must be positive".into());
    }

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let map = ObstacleMap::arena(&mut rng);
    map.validate()?;
    info!(
        "Arena {}x{} with {} obstacles",
        map.width,
        map.height,
        map.obstacles.len()
    );

    let provider = MemoryBalanceProvider::new(args.starting_balance)
        .with_latency(Duration::from_millis(args.provider_latency_ms));
    let ledger = Arc::new(Ledger::new(Arc::new(provider), args.entry_fee));

    let game_config = GameConfig::for_tick_rate(args.tick_rate);
    let game_state = match args.seed {
        Some(seed) => GameState::with_seed(Arc::new(map), game_config, seed),
        None => GameState::new(Arc::new(map), game_config),
    };

    let config = ServerConfig {
        tick_rate: args.tick_rate,
        max_clients: args.max_clients,
        ..ServerConfig::default()
    };

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, config, game_state, ledger).await?;
    server.run().await
}
