pub mod command;
pub mod config;

use command::{Command, CommandReply};
use config::ManagerConfig;

use anyhow::Result;
use moka::future::Cache;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::controller::StageController;
use crate::waveform::ScanSettings;

type Stages = Arc<RwLock<HashMap<String, StageController>>>;

/// Registry of named stage controllers. Commands flow through an mpsc
/// channel into a single command loop; readback responses are fronted
/// by a short-TTL cache so protocol clients cannot hammer the port.
pub struct StageManager {
    stages: Stages,
    cmd_sender: mpsc::Sender<Command>,
    cache: Cache<String, Value>,
    config: ManagerConfig,
}

impl StageManager {
    pub fn new(config: ManagerConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity as u64)
            .time_to_live(config.default_ttl)
            .build();

        let (tx, rx) = mpsc::channel::<Command>(100);

        let stages: Stages = Arc::new(RwLock::new(HashMap::new()));
        tokio::spawn(Self::command_loop(stages.clone(), cache.clone(), rx));

        StageManager {
            stages,
            cmd_sender: tx,
            cache,
            config,
        }
    }

    /// Connect the controller and make it addressable under `name`.
    pub async fn register_stage(&self, name: String, controller: StageController) -> Result<()> {
        controller.connect().await?;
        info!(stage = %name, "stage registered");
        let mut stages = self.stages.write().await;
        stages.insert(name, controller);
        Ok(())
    }

    pub async fn unregister_stage(&self, name: &str) -> Result<()> {
        let removed = {
            let mut stages = self.stages.write().await;
            stages.remove(name)
        };
        if let Some(controller) = removed {
            controller.disconnect().await?;
            info!(stage = %name, "stage unregistered");
        }
        Ok(())
    }

    /// Disconnect every registered stage.
    pub async fn shutdown(&self) -> Result<()> {
        let mut stages = self.stages.write().await;
        for (name, controller) in stages.drain() {
            if let Err(err) = controller.disconnect().await {
                tracing::warn!(stage = %name, error = %err, "disconnect during shutdown failed");
            }
        }
        Ok(())
    }

    pub async fn send_command(&self, cmd: Command) -> Result<()> {
        self.cmd_sender.send(cmd).await?;
        Ok(())
    }

    pub fn cache(&self) -> &Cache<String, Value> {
        &self.cache
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    async fn command_loop(stages: Stages, cache: Cache<String, Value>, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Move {
                    stage,
                    target,
                    backlash,
                    resp,
                } => {
                    let result = Self::handle_move(&stages, &cache, &stage, target, backlash).await;
                    let _ = resp.send(result);
                }
                Command::MoveRelative {
                    stage,
                    delta,
                    backlash,
                    resp,
                } => {
                    let result =
                        Self::handle_move_relative(&stages, &cache, &stage, delta, backlash).await;
                    let _ = resp.send(result);
                }
                Command::Stop { stage, resp } => {
                    let result = Self::handle_stop(&stages, &cache, &stage).await;
                    let _ = resp.send(result);
                }
                Command::SetHome { stage, resp } => {
                    let result = Self::handle_set_home(&stages, &cache, &stage).await;
                    let _ = resp.send(result);
                }
                Command::GoHome { stage, resp } => {
                    let result = Self::handle_go_home(&stages, &cache, &stage).await;
                    let _ = resp.send(result);
                }
                Command::SetVelocity {
                    stage,
                    velocity,
                    resp,
                } => {
                    let result = Self::handle_set_velocity(&stages, &cache, &stage, velocity).await;
                    let _ = resp.send(result);
                }
                Command::GetPosition { stage, resp } => {
                    let result = Self::handle_get_position(&stages, &cache, &stage).await;
                    let _ = resp.send(result);
                }
                Command::GetStatus { stage, resp } => {
                    let result = Self::handle_get_status(&stages, &cache, &stage).await;
                    let _ = resp.send(result);
                }
                Command::StartScan {
                    stage,
                    settings,
                    resp,
                } => {
                    let result = Self::handle_start_scan(&stages, &cache, &stage, settings).await;
                    let _ = resp.send(result);
                }
                Command::ListStages { resp } => {
                    let result = Self::handle_list_stages(&stages).await;
                    let _ = resp.send(result);
                }
            }
        }
    }

    async fn stage(stages: &Stages, name: &str) -> Result<StageController> {
        let stages = stages.read().await;
        stages
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Stage not found: {}", name))
    }

    async fn invalidate_readbacks(cache: &Cache<String, Value>, stage: &str) {
        cache.invalidate(&format!("{}::position", stage)).await;
        cache.invalidate(&format!("{}::status", stage)).await;
    }

    async fn handle_move(
        stages: &Stages,
        cache: &Cache<String, Value>,
        stage: &str,
        target: f64,
        backlash: bool,
    ) -> Result<CommandReply> {
        let controller = Self::stage(stages, stage).await?;
        let report = controller.move_absolute(target, backlash).await?;
        Self::invalidate_readbacks(cache, stage).await;

        let mut reply = CommandReply::from(
            json!({"status": "ok", "action": "move", "commanded": report.commanded}),
        );
        if report.out_of_range {
            reply = reply.with_warning(format!(
                "target {} outside motion range, commanded {}",
                target, report.commanded
            ));
        }
        Ok(reply)
    }

    async fn handle_move_relative(
        stages: &Stages,
        cache: &Cache<String, Value>,
        stage: &str,
        delta: f64,
        backlash: bool,
    ) -> Result<CommandReply> {
        let controller = Self::stage(stages, stage).await?;
        let report = controller.move_relative(delta, backlash).await?;
        Self::invalidate_readbacks(cache, stage).await;

        let mut reply = CommandReply::from(
            json!({"status": "ok", "action": "move_relative", "commanded": report.commanded}),
        );
        if report.out_of_range {
            reply = reply.with_warning(format!(
                "displacement {} would leave the motion range, zeroed",
                delta
            ));
        }
        Ok(reply)
    }

    async fn handle_stop(
        stages: &Stages,
        cache: &Cache<String, Value>,
        stage: &str,
    ) -> Result<CommandReply> {
        let controller = Self::stage(stages, stage).await?;
        controller.stop().await;
        Self::invalidate_readbacks(cache, stage).await;
        Ok(json!({"status": "ok", "action": "stop"}).into())
    }

    async fn handle_set_home(
        stages: &Stages,
        cache: &Cache<String, Value>,
        stage: &str,
    ) -> Result<CommandReply> {
        let controller = Self::stage(stages, stage).await?;
        controller.set_home().await?;
        Self::invalidate_readbacks(cache, stage).await;
        Ok(json!({"status": "ok", "action": "set_home"}).into())
    }

    async fn handle_go_home(
        stages: &Stages,
        cache: &Cache<String, Value>,
        stage: &str,
    ) -> Result<CommandReply> {
        let controller = Self::stage(stages, stage).await?;
        controller.go_home().await?;
        Self::invalidate_readbacks(cache, stage).await;
        Ok(json!({"status": "ok", "action": "go_home"}).into())
    }

    async fn handle_set_velocity(
        stages: &Stages,
        cache: &Cache<String, Value>,
        stage: &str,
        velocity: f64,
    ) -> Result<CommandReply> {
        let controller = Self::stage(stages, stage).await?;
        let applied = controller.set_velocity(velocity).await?;
        Self::invalidate_readbacks(cache, stage).await;

        let mut reply = CommandReply::from(
            json!({"status": "ok", "action": "set_velocity", "applied": applied}),
        );
        if applied != velocity {
            reply = reply.with_warning(format!(
                "velocity {} outside stage range, applied {}",
                velocity, applied
            ));
        }
        Ok(reply)
    }

    async fn handle_get_position(
        stages: &Stages,
        cache: &Cache<String, Value>,
        stage: &str,
    ) -> Result<CommandReply> {
        let cache_key = format!("{}::position", stage);
        if let Some(value) = cache.get(&cache_key).await {
            return Ok(json!({"stage": stage, "position": value}).into());
        }

        let controller = Self::stage(stages, stage).await?;
        let value = json!(controller.position().await);
        cache.insert(cache_key, value.clone()).await;
        Ok(json!({"stage": stage, "position": value}).into())
    }

    async fn handle_get_status(
        stages: &Stages,
        cache: &Cache<String, Value>,
        stage: &str,
    ) -> Result<CommandReply> {
        let cache_key = format!("{}::status", stage);
        if let Some(value) = cache.get(&cache_key).await {
            return Ok(json!({"stage": stage, "state": value}).into());
        }

        let controller = Self::stage(stages, stage).await?;
        let value = serde_json::to_value(controller.status().await)?;
        cache.insert(cache_key, value.clone()).await;
        Ok(json!({"stage": stage, "state": value}).into())
    }

    async fn handle_start_scan(
        stages: &Stages,
        cache: &Cache<String, Value>,
        stage: &str,
        settings: ScanSettings,
    ) -> Result<CommandReply> {
        let controller = Self::stage(stages, stage).await?;
        let handle = controller.start_scan(&settings).await?;
        Self::invalidate_readbacks(cache, stage).await;
        Ok(json!({
            "status": "ok",
            "action": "start_scan",
            "run_id": handle.id,
            "phase": handle.phase().label(),
        })
        .into())
    }

    async fn handle_list_stages(stages: &Stages) -> Result<CommandReply> {
        let stages = stages.read().await;
        let names: Vec<String> = stages.keys().cloned().collect();
        Ok(json!({"stages": names}).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{StageConfig, StageModel};
    use crate::port::mock::MockStagePort;
    use tokio::sync::oneshot;

    async fn manager_with_stage() -> (StageManager, MockStagePort) {
        let manager = StageManager::new(ManagerConfig::default());
        let mock = MockStagePort::new();
        let controller = StageController::new(
            StageConfig::new("SIM0001", StageModel::generic("SIM-STAGE.01", 10.0)),
            Box::new(mock.clone()),
        );
        manager
            .register_stage("sim".to_string(), controller)
            .await
            .unwrap();
        (manager, mock)
    }

    #[tokio::test(start_paused = true)]
    async fn move_command_reports_range_warnings() {
        let (manager, _mock) = manager_with_stage().await;

        let (tx, rx) = oneshot::channel();
        manager
            .send_command(Command::Move {
                stage: "sim".to_string(),
                target: 7.0,
                backlash: false,
                resp: tx,
            })
            .await
            .unwrap();
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.data["commanded"], json!(5.0));
        assert_eq!(reply.warnings.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_stage_is_an_error() {
        let (manager, _mock) = manager_with_stage().await;

        let (tx, rx) = oneshot::channel();
        manager
            .send_command(Command::GetPosition {
                stage: "nope".to_string(),
                resp: tx,
            })
            .await
            .unwrap();
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn list_and_unregister() {
        let (manager, mock) = manager_with_stage().await;

        let (tx, rx) = oneshot::channel();
        manager
            .send_command(Command::ListStages { resp: tx })
            .await
            .unwrap();
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.data["stages"], json!(["sim"]));

        manager.unregister_stage("sim").await.unwrap();
        assert_eq!(
            mock.count_calls(|c| matches!(c, crate::port::mock::PortCall::Disconnect)),
            1
        );
    }
}
