use anyhow::Result;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::waveform::ScanSettings;

/// Payload of a successful command, with soft-violation warnings kept
/// separate from the data so the protocol layer can surface them.
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub data: Value,
    pub warnings: Vec<String>,
}

impl CommandReply {
    pub fn with_warning(mut self, warning: String) -> Self {
        self.warnings.push(warning);
        self
    }
}

impl From<Value> for CommandReply {
    fn from(data: Value) -> Self {
        Self {
            data,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub enum Command {
    Move {
        stage: String,
        target: f64,
        backlash: bool,
        resp: oneshot::Sender<Result<CommandReply>>,
    },
    MoveRelative {
        stage: String,
        delta: f64,
        backlash: bool,
        resp: oneshot::Sender<Result<CommandReply>>,
    },
    Stop {
        stage: String,
        resp: oneshot::Sender<Result<CommandReply>>,
    },
    SetHome {
        stage: String,
        resp: oneshot::Sender<Result<CommandReply>>,
    },
    GoHome {
        stage: String,
        resp: oneshot::Sender<Result<CommandReply>>,
    },
    SetVelocity {
        stage: String,
        velocity: f64,
        resp: oneshot::Sender<Result<CommandReply>>,
    },
    GetPosition {
        stage: String,
        resp: oneshot::Sender<Result<CommandReply>>,
    },
    GetStatus {
        stage: String,
        resp: oneshot::Sender<Result<CommandReply>>,
    },
    StartScan {
        stage: String,
        settings: ScanSettings,
        resp: oneshot::Sender<Result<CommandReply>>,
    },
    ListStages {
        resp: oneshot::Sender<Result<CommandReply>>,
    },
}
