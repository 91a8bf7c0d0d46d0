//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p sync_client -- [--addr 127.0.0.1:27015] [--tick-hz 60] [--wander]
//!
//! The client connects, mirrors what the server streams and sends input every
//! tick. With `--wander` it walks in a slow circle.
//!
//! Console commands:
//!   status        - Show client status
//!   say <message> - Send chat message
//!   disconnect    - Disconnect from server
//!   quit          - Exit client
//!   anything else is sent to the server as a /command

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::{bail, Context};
use sync_client::client::{ClientState, GameClient};
use sync_client::input::InputState;
use sync_shared::config::ClientConfig;
use tokio::sync::mpsc;
use tracing::info;

struct Args {
    cfg: ClientConfig,
    wander: bool,
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let mut cfg = ClientConfig::default();
    let mut wander = false;
    let mut i = 0;
    while i < args.len() {
        match (args[i].as_str(), args.get(i + 1)) {
            ("--addr", Some(v)) => {
                cfg.server_addr = v.clone();
                i += 2;
            }
            ("--tick-hz", Some(v)) => {
                cfg.tick_hz = v.parse().with_context(|| format!("invalid tick rate '{v}'"))?;
                i += 2;
            }
            ("--wander", _) => {
                wander = true;
                i += 1;
            }
            (other, _) => bail!("unexpected argument '{other}'"),
        }
    }
    if cfg.tick_hz == 0 {
        bail!("tick rate must be positive");
    }
    Ok(Args { cfg, wander })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Args { cfg, wander } = parse_args(&args)?;
    info!(server = %cfg.server_addr, tick_hz = cfg.tick_hz, wander, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

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

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = Duration::from_secs_f64(1.0 / f64::from(cfg.tick_hz));
    let mut yaw = 0.0f32;

    loop {
        while let Ok(line) = console_rx.try_recv() {
            if matches!(line.as_str(), "quit" | "exit") {
                client.disconnect().await.ok();
                return Ok(());
            }
            match client.exec_console(&line).await {
                Ok(output) => {
                    for line in output {
                        println!("{line}");
                    }
                }
                Err(e) => println!("Error: {e:#}"),
            }
        }

        client.poll();
        if client.state == ClientState::Disconnected {
            println!("Disconnected from server.");
            break;
        }

        let input = if wander {
            yaw += 0.01;
            InputState {
                forward: 1.0,
                yaw,
                ..Default::default()
            }
        } else {
            InputState::default()
        };
        if let Some(cmd) = client.send_input(input).await? {
            if cmd.tick % 300 == 0 {
                let own = client.mirror.own().map(|h| h.transform.position);
                info!(tick = cmd.tick, humans = client.mirror.humans.len(), position = ?own, "Client tick");
            }
        }

        tokio::time::sleep(tick_interval).await;
    }

    Ok(())
}
