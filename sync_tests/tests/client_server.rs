//! Full socket-based integration tests for client ↔ server communication.

use std::time::Duration;

use sync_client::input::InputState;
use sync_client::GameClient;
use sync_server::server::{bind_ephemeral, GameServer};
use sync_shared::config::{ClientConfig, ServerConfig};
use sync_shared::ecs::Transform;

const WAIT: Duration = Duration::from_secs(5);

/// Full integration: spawn server, connect client, send input, watch it move.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_server_full_roundtrip() -> anyhow::Result<()> {
    sync_tests::init_tracing();

    // Bind server to ephemeral port.
    let (mut server, cfg) = bind_ephemeral(64).await?;
    let client_cfg = ClientConfig {
        server_addr: cfg.bind_addr.clone(),
        tick_hz: 64,
    };

    // Run the server loop in the background for a couple of seconds.
    let server_handle = tokio::spawn(async move {
        server.run_for_ticks(160).await?;
        Ok::<_, anyhow::Error>(server)
    });

    let mut client = GameClient::connect(&client_cfg).await?;
    assert!(client.wait_for(WAIT, |m| m.own().is_some()).await);
    assert!(client.mirror.weather.is_some());
    let entity = client.mirror.own_entity.unwrap();

    for _ in 0..20 {
        client
            .send_input(InputState {
                forward: 1.0,
                ..Default::default()
            })
            .await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        client
            .wait_for(WAIT, |m| m.own().is_some_and(|h| h.transform.position.x > 0.0))
            .await
    );

    client.send_chat("/noop").await?;
    client.disconnect().await?;

    let server = server_handle.await??;
    assert!(server.context().peers.is_empty());
    assert!(server.context().store.try_get::<Transform>(entity).is_none());
    Ok(())
}

/// Two clients see each other spawn and see the first one leave.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clients_observe_each_other() -> anyhow::Result<()> {
    sync_tests::init_tracing();

    let (mut server, cfg) = bind_ephemeral(64).await?;
    let client_cfg = ClientConfig {
        server_addr: cfg.bind_addr.clone(),
        tick_hz: 64,
    };
    let server_handle = tokio::spawn(async move {
        server.run_for_ticks(160).await?;
        Ok::<_, anyhow::Error>(server)
    });

    let mut a = GameClient::connect(&client_cfg).await?;
    let mut b = GameClient::connect(&client_cfg).await?;
    assert!(a.wait_for(WAIT, |m| m.own().is_some()).await);
    assert!(b.wait_for(WAIT, |m| m.own().is_some()).await);
    let ea = a.mirror.own_entity.unwrap();
    let eb = b.mirror.own_entity.unwrap();
    assert_ne!(ea, eb);

    assert!(a.wait_for(WAIT, |m| m.humans.contains_key(&eb)).await);
    assert!(b.wait_for(WAIT, |m| m.humans.contains_key(&ea)).await);

    a.send_chat("hi from a").await?;
    a.disconnect().await?;
    assert!(b.wait_for(WAIT, |m| !m.humans.contains_key(&ea)).await);

    server_handle.await??;
    Ok(())
}

/// A client that never reads keeps its connection through a long stream of
/// updates for its one entity, with chat broadcasts mixed in.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_reader_survives_a_long_update_stream() -> anyhow::Result<()> {
    sync_tests::init_tracing();

    let cfg = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        outbound_capacity: 32,
        ..ServerConfig::default()
    };
    let mut server = GameServer::bind(cfg).await?;
    let addr = server.local_addr().expect("bound server has an address");
    let _stalled = tokio::net::TcpStream::connect(addr).await?;

    let deadline = tokio::time::Instant::now() + WAIT;
    while server.context().peers.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "peer never accepted");
        server.step()?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let peer = server.context().peers.ids()[0];

    for tick in 0..60_000u32 {
        if tick % 5_000 == 0 {
            server.exec_console(&format!("say backlog {tick}"));
        }
        server.step()?;
        if tick % 100 == 0 {
            tokio::task::yield_now().await;
        }
        assert!(
            server.context().peers.is_connected(peer),
            "stalled peer dropped at tick {tick}"
        );
    }
    Ok(())
}
