use anyhow::Result;
use stagehand::{
    controller::{StageConfig, StageController, StageModel},
    manager::{
        command::Command,
        config::ManagerConfig,
        StageManager,
    },
    port::mock::MockStagePort,
    socket_server::{config::SocketServerConfig, SocketServer},
    waveform::{ScanMode, ScanSettings, StartPoint},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tracing::{error, info};

async fn send(manager: &StageManager, label: &str, make: impl FnOnce(oneshot::Sender<Result<stagehand::manager::command::CommandReply>>) -> Command) {
    let (tx, rx) = oneshot::channel();
    if let Err(err) = manager.send_command(make(tx)).await {
        error!("{} could not be queued: {}", label, err);
        return;
    }
    match rx.await {
        Ok(Ok(reply)) => {
            info!("{} result: {}", label, reply.data);
            for warning in &reply.warnings {
                info!("{} warning: {}", label, warning);
            }
        }
        Ok(Err(err)) => error!("{} failed: {}", label, err),
        Err(err) => error!("{} dropped: {}", label, err),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("Starting Stagehand with a simulated voice-coil stage");

    let manager = Arc::new(StageManager::new(ManagerConfig {
        default_ttl: Duration::from_millis(250),
        cache_capacity: 1024,
    }));

    let mock = MockStagePort::new().with_limits(-5.0, 5.0);
    // the demo generator "runs" for three polls, then reports done
    mock.script_generator_polls(Some(3));

    let config = StageConfig::new("0185500006", StageModel::known("V-524.1AA").unwrap());
    let controller = StageController::new(config, Box::new(mock.clone()));
    manager
        .register_stage("focus".to_string(), controller)
        .await?;
    info!("Registered simulated stage 'focus' (V-524.1AA, travel -5..5 mm)");

    let socket_config = SocketServerConfig {
        socket_path: "/tmp/stagehand.sock".to_string(),
        max_connections: 50,
    };
    let mut socket_server = SocketServer::new(socket_config, manager.clone());
    socket_server.start().await?;

    info!("Socket server started at /tmp/stagehand.sock");
    info!("You can connect with socat:");
    info!("  socat - UNIX-CONNECT:/tmp/stagehand.sock");
    info!(r#"  echo '{{"type": "ping"}}' | socat - UNIX-CONNECT:/tmp/stagehand.sock"#);

    send(&manager, "move", |resp| Command::Move {
        stage: "focus".to_string(),
        target: 2.0,
        backlash: false,
        resp,
    })
    .await;

    // out of range on purpose: clamped with a warning, not rejected
    send(&manager, "move (out of range)", |resp| Command::Move {
        stage: "focus".to_string(),
        target: 7.0,
        backlash: true,
        resp,
    })
    .await;

    send(&manager, "set_home", |resp| Command::SetHome {
        stage: "focus".to_string(),
        resp,
    })
    .await;

    send(&manager, "status", |resp| Command::GetStatus {
        stage: "focus".to_string(),
        resp,
    })
    .await;

    let settings = ScanSettings {
        mode: ScanMode::Sinusoidal,
        amplitude: 3.0,
        cycles: 2,
        table_rate: 2,
        frequency_hz: 5.0,
        start: StartPoint::Home,
        center_point: None,
        speed_up_down: None,
    };
    send(&manager, "start_scan", |resp| Command::StartScan {
        stage: "focus".to_string(),
        settings,
        resp,
    })
    .await;

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        send(&manager, "status", |resp| Command::GetStatus {
            stage: "focus".to_string(),
            resp,
        })
        .await;
    }

    info!("Server will run for 600 seconds for manual testing...");
    tokio::time::sleep(Duration::from_secs(600)).await;

    info!("Shutting down...");
    socket_server.shutdown().await?;
    manager.unregister_stage("focus").await?;
    info!("Stagehand shutdown complete");

    Ok(())
}
