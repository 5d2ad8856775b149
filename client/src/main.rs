use clap::Parser;
use client::network::{spawn_network, Client, Session};
use log::{error, info};
use macroquad::prelude::Conf;
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Identity used for the wallet
    #[arg(short = 'u', long, default_value = "guest")]
    user_id: String,

    /// Display name
    #[arg(short = 'n', long, default_value = "")]
    name: String,

    /// Tank colour as RRGGBB hex
    #[arg(short = 'c', long, default_value = "44aa44")]
    color: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Window width
    #[arg(short = 'w', long, default_value = "1280")]
    width: usize,

    /// Window height (no short flag to avoid conflict with --help)
    #[arg(long, default_value = "720")]
    height: usize,
}

fn window_conf() -> Conf {
    let args = Args::parse();
    Conf {
        window_title: "Tank Arena".to_owned(),
        window_width: args.width as i32,
        window_height: args.height as i32,
        ..Default::default()
    }
}

#[macroquad::main(window_conf)]
async fn main() {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    if let Err(e) = start(Args::parse()).await {
        error!("Client failed: {}", e);
        std::process::exit(1);
    }
}

async fn start(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let server: SocketAddr = args.server.parse()?;
    let color = u32::from_str_radix(args.color.trim_start_matches('#'), 16)?;
    let name = if args.name.is_empty() {
        args.user_id.clone()
    } else {
        args.name.clone()
    };

    info!("Connecting to: {}", server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }
    info!("Controls: WASD to move, mouse to aim and shoot, C cash out, Q quit, J join");
    info!("Press 1/2/3 to toggle Prediction/Reconciliation/Interpolation");

    let network = spawn_network(server, args.fake_ping)?;
    let session = Session::new(args.user_id, name, color);
    let mut client = Client::new(network, session, args.fake_ping, args.width, args.height);

    client.run().await;

    Ok(())
}
