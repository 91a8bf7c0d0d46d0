//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p sync_server -- [--config server.json] [--port 27015] [--scripts bundle.json] [--tick-hz 60]
//!
//! Console commands:
//!   status                 - Show server status
//!   say <text>             - Broadcast chat
//!   time <h> <m>           - Set time of day
//!   date <d> <mo>          - Set date
//!   weather <name>         - Set weather preset
//!   season <name>          - Set season
//!   kick <peer>            - Disconnect a peer
//!   reset                  - Respawn every player
//!   quit                   - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use sync_server::GameServer;
use sync_shared::config::ServerConfig;
use tokio::sync::mpsc;
use tracing::{error, info};

const USAGE: &str = "usage: server [--config <file>] [--port <port>] [--scripts <bundle>] [--tick-hz <hz>]";

fn with_port(addr: &str, port: u16) -> String {
    match addr.rsplit_once(':') {
        Some((host, _)) => format!("{host}:{port}"),
        None => format!("{addr}:{port}"),
    }
}

fn parse_args(args: &[String]) -> anyhow::Result<ServerConfig> {
    // The config file comes first so flags override it.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            ServerConfig::load(Path::new(path))?
        }
        None => ServerConfig::default(),
    };

    let mut i = 0;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--config", Some(_)) => {}
            ("--port", Some(v)) => {
                let port: u16 = v.parse().with_context(|| format!("invalid port '{v}'"))?;
                cfg.bind_addr = with_port(&cfg.bind_addr, port);
            }
            ("--scripts", Some(v)) => cfg.script_bundle = Some(PathBuf::from(v)),
            ("--tick-hz", Some(v)) => {
                cfg.tick_hz = v.parse().with_context(|| format!("invalid tick rate '{v}'"))?;
                if cfg.tick_hz == 0 {
                    bail!("tick rate must be positive");
                }
            }
            (other, _) => bail!("unexpected argument '{other}'\n{USAGE}"),
        }
        i += 2;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{USAGE}");
        return Ok(());
    }
    let cfg = parse_args(&args)?;
    info!(addr = %cfg.bind_addr, tick_hz = cfg.tick_hz, scripts = ?cfg.script_bundle, "Starting server");

    let mut server = GameServer::bind(cfg).await.context("start server")?;
    if let Some(local) = server.local_addr() {
        info!(%local, "Server listening");
    }

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    let signal_tx = console_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_tx.send("quit".to_string()).await;
        }
    });

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'help' for commands, 'quit' to exit.");
    println!();

    if let Err(e) = server.run().await {
        error!(error = %format!("{e:#}"), "server loop stopped");
        return Err(e);
    }
    Ok(())
}
