use serde::{Deserialize, Serialize};

use crate::waveform::ScanSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    /// Absolute move to a home-relative target in mm.
    #[serde(rename = "move")]
    Move {
        stage: String,
        target: f64,
        #[serde(default)]
        backlash: bool,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "move_relative")]
    MoveRelative {
        stage: String,
        delta: f64,
        #[serde(default)]
        backlash: bool,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "stop")]
    Stop {
        stage: String,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "set_home")]
    SetHome {
        stage: String,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "go_home")]
    GoHome {
        stage: String,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "set_velocity")]
    SetVelocity {
        stage: String,
        velocity: f64,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "get_position")]
    GetPosition {
        stage: String,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "get_status")]
    GetStatus {
        stage: String,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "start_scan")]
    StartScan {
        stage: String,
        settings: ScanSettings,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "list_stages")]
    ListStages {
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        id: Option<String>,
    },
}

impl ClientCommand {
    pub fn id(&self) -> Option<&String> {
        match self {
            ClientCommand::Move { id, .. } => id.as_ref(),
            ClientCommand::MoveRelative { id, .. } => id.as_ref(),
            ClientCommand::Stop { id, .. } => id.as_ref(),
            ClientCommand::SetHome { id, .. } => id.as_ref(),
            ClientCommand::GoHome { id, .. } => id.as_ref(),
            ClientCommand::SetVelocity { id, .. } => id.as_ref(),
            ClientCommand::GetPosition { id, .. } => id.as_ref(),
            ClientCommand::GetStatus { id, .. } => id.as_ref(),
            ClientCommand::StartScan { id, .. } => id.as_ref(),
            ClientCommand::ListStages { id, .. } => id.as_ref(),
            ClientCommand::Ping { id, .. } => id.as_ref(),
        }
    }
}
