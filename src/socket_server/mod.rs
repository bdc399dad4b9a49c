pub mod config;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    net::{UnixListener, UnixStream},
    sync::oneshot,
};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::{
    manager::{
        command::{Command, CommandReply},
        StageManager,
    },
    protocol::{
        client_command::ClientCommand, parse_command, serialize_response,
        server_response::ServerResponse,
    },
};
use config::SocketServerConfig;

/// Newline-delimited JSON command server over a unix domain socket.
pub struct SocketServer {
    config: SocketServerConfig,
    manager: Arc<StageManager>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl SocketServer {
    pub fn new(config: SocketServerConfig, manager: Arc<StageManager>) -> Self {
        Self {
            config,
            manager,
            shutdown_tx: None,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        if Path::new(&self.config.socket_path).exists() {
            tokio::fs::remove_file(&self.config.socket_path).await?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)?;
        info!("Socket server listening on: {}", self.config.socket_path);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let manager = self.manager.clone();
        let max_connections = self.config.max_connections;

        tokio::spawn(async move {
            let active_connections = Arc::new(AtomicUsize::new(0));

            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _addr)) => {
                                if active_connections.load(Ordering::Relaxed) >= max_connections {
                                    warn!("Maximum connections reached, rejecting new connection");
                                    continue;
                                }

                                active_connections.fetch_add(1, Ordering::Relaxed);
                                let manager = manager.clone();
                                let mut shutdown_rx = shutdown_rx.resubscribe();
                                let active_connections = active_connections.clone();

                                tokio::spawn(async move {
                                    if let Err(err) =
                                        Self::handle_client(stream, manager, &mut shutdown_rx).await
                                    {
                                        error!("Client handler error: {}", err);
                                    }
                                    let remaining =
                                        active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
                                    debug!("Client disconnected. Active connections: {}", remaining);
                                });
                            }
                            Err(err) => {
                                error!("Failed to accept connection: {}", err);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Socket server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }

        if Path::new(&self.config.socket_path).exists() {
            tokio::fs::remove_file(&self.config.socket_path).await?;
        }

        info!("Socket server shutdown complete");
        Ok(())
    }

    async fn handle_client(
        stream: UnixStream,
        manager: Arc<StageManager>,
        shutdown_rx: &mut tokio::sync::broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut framed = Framed::new(stream, LinesCodec::new());

        loop {
            tokio::select! {
                line_result = framed.next() => {
                    match line_result {
                        Some(Ok(line)) => {
                            debug!("Received command: {}", line);

                            let response = Self::process_command(&line, &manager).await;
                            let response_json = serialize_response(&response)?;

                            if let Err(err) = framed.send(response_json).await {
                                warn!("Failed to send response: {}", err);
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            warn!("Framing error: {}", err);
                            break;
                        }
                        None => break,
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Client handler shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn process_command(line: &str, manager: &StageManager) -> ServerResponse {
        let command = match parse_command(line) {
            Ok(cmd) => cmd,
            Err(err) => {
                return ServerResponse::error(None, format!("Failed to parse command: {}", err));
            }
        };

        let command_id = command.id().cloned();

        match Self::execute_command(command, manager).await {
            Ok(reply) if reply.warnings.is_empty() => {
                ServerResponse::success(command_id, reply.data)
            }
            Ok(reply) => {
                ServerResponse::success_with_warnings(command_id, reply.data, reply.warnings)
            }
            Err(err) => ServerResponse::error(command_id, err.to_string()),
        }
    }

    async fn dispatch(
        manager: &StageManager,
        make: impl FnOnce(oneshot::Sender<Result<CommandReply>>) -> Command,
    ) -> Result<CommandReply> {
        let (tx, rx) = oneshot::channel();
        manager.send_command(make(tx)).await?;
        rx.await?
    }

    async fn execute_command(
        command: ClientCommand,
        manager: &StageManager,
    ) -> Result<CommandReply> {
        match command {
            ClientCommand::Move {
                stage,
                target,
                backlash,
                ..
            } => {
                Self::dispatch(manager, |resp| Command::Move {
                    stage,
                    target,
                    backlash,
                    resp,
                })
                .await
            }
            ClientCommand::MoveRelative {
                stage,
                delta,
                backlash,
                ..
            } => {
                Self::dispatch(manager, |resp| Command::MoveRelative {
                    stage,
                    delta,
                    backlash,
                    resp,
                })
                .await
            }
            ClientCommand::Stop { stage, .. } => {
                Self::dispatch(manager, |resp| Command::Stop { stage, resp }).await
            }
            ClientCommand::SetHome { stage, .. } => {
                Self::dispatch(manager, |resp| Command::SetHome { stage, resp }).await
            }
            ClientCommand::GoHome { stage, .. } => {
                Self::dispatch(manager, |resp| Command::GoHome { stage, resp }).await
            }
            ClientCommand::SetVelocity {
                stage, velocity, ..
            } => {
                Self::dispatch(manager, |resp| Command::SetVelocity {
                    stage,
                    velocity,
                    resp,
                })
                .await
            }
            ClientCommand::GetPosition { stage, .. } => {
                Self::dispatch(manager, |resp| Command::GetPosition { stage, resp }).await
            }
            ClientCommand::GetStatus { stage, .. } => {
                Self::dispatch(manager, |resp| Command::GetStatus { stage, resp }).await
            }
            ClientCommand::StartScan {
                stage, settings, ..
            } => {
                Self::dispatch(manager, |resp| Command::StartScan {
                    stage,
                    settings,
                    resp,
                })
                .await
            }
            ClientCommand::ListStages { .. } => {
                Self::dispatch(manager, |resp| Command::ListStages { resp }).await
            }
            ClientCommand::Ping { .. } => Ok(json!({
                "message": "pong",
                "timestamp": chrono::Utc::now().to_rfc3339()
            })
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{StageConfig, StageController, StageModel};
    use crate::manager::config::ManagerConfig;
    use crate::port::mock::MockStagePort;

    async fn running_server() -> (SocketServer, String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir
            .path()
            .join("stagehand-test.sock")
            .to_string_lossy()
            .to_string();

        let manager = Arc::new(StageManager::new(ManagerConfig::default()));
        let controller = StageController::new(
            StageConfig::new("SIM0001", StageModel::generic("SIM-STAGE.01", 10.0)),
            Box::new(MockStagePort::new()),
        );
        manager
            .register_stage("sim".to_string(), controller)
            .await
            .unwrap();

        let mut server = SocketServer::new(
            SocketServerConfig {
                socket_path: socket_path.clone(),
                max_connections: 4,
            },
            manager,
        );
        server.start().await.unwrap();
        (server, socket_path, dir)
    }

    async fn roundtrip(framed: &mut Framed<UnixStream, LinesCodec>, request: &str) -> String {
        framed.send(request.to_string()).await.unwrap();
        framed.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn ping_and_move_over_the_socket() {
        let (server, socket_path, _dir) = running_server().await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let mut framed = Framed::new(stream, LinesCodec::new());

        let pong = roundtrip(&mut framed, r#"{"type": "ping", "id": "p1"}"#).await;
        assert!(pong.contains("pong"));
        assert!(pong.contains("p1"));

        let moved = roundtrip(
            &mut framed,
            r#"{"type": "move", "stage": "sim", "target": 7.0}"#,
        )
        .await;
        assert!(moved.contains("success"));
        assert!(moved.contains("warnings"));

        let unknown = roundtrip(
            &mut framed,
            r#"{"type": "get_position", "stage": "ghost"}"#,
        )
        .await;
        assert!(unknown.contains("error"));
        assert!(unknown.contains("Stage not found"));

        server.shutdown().await.unwrap();
    }
}
