pub mod client_command;
pub mod error;
pub mod server_response;

use client_command::ClientCommand;
use error::ProtocolError;
use server_response::ServerResponse;

pub fn parse_command(json_str: &str) -> Result<ClientCommand, ProtocolError> {
    serde_json::from_str(json_str).map_err(ProtocolError::from)
}

pub fn serialize_response(response: &ServerResponse) -> Result<String, ProtocolError> {
    serde_json::to_string(response).map_err(ProtocolError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_move_command() {
        let json = r#"{"type": "move", "stage": "focus", "target": 2.5, "backlash": true}"#;
        let cmd = parse_command(json).unwrap();

        match cmd {
            ClientCommand::Move {
                stage,
                target,
                backlash,
                ..
            } => {
                assert_eq!(stage, "focus");
                assert_eq!(target, 2.5);
                assert!(backlash);
            }
            _ => panic!("Expected Move command"),
        }
    }

    #[test]
    fn test_parse_start_scan_command() {
        let json = r#"{
            "type": "start_scan",
            "stage": "focus",
            "settings": {
                "mode": "sinusoidal",
                "amplitude": 3.0,
                "cycles": 2,
                "table_rate": 2,
                "frequency_hz": 5.0,
                "start": "home"
            },
            "id": "scan-1"
        }"#;
        let cmd = parse_command(json).unwrap();

        match cmd {
            ClientCommand::StartScan { stage, settings, id } => {
                assert_eq!(stage, "focus");
                assert_eq!(settings.cycles, 2);
                assert_eq!(id.as_deref(), Some("scan-1"));
            }
            _ => panic!("Expected StartScan command"),
        }
    }

    #[test]
    fn test_serialize_success_response() {
        let response = ServerResponse::success(
            Some("test-id".to_string()),
            serde_json::json!({"result": "ok"}),
        );

        let json = serialize_response(&response).unwrap();
        assert!(json.contains("success"));
        assert!(json.contains("test-id"));
        // empty warning lists stay off the wire
        assert!(!json.contains("warnings"));
    }

    #[test]
    fn test_serialize_response_with_warnings() {
        let response = ServerResponse::success_with_warnings(
            None,
            serde_json::json!({"commanded": 5.0}),
            vec!["target 7 outside motion range, commanded 5".to_string()],
        );

        let json = serialize_response(&response).unwrap();
        assert!(json.contains("warnings"));
        assert!(json.contains("outside motion range"));
    }

    #[test]
    fn test_serialize_error_response() {
        let response = ServerResponse::error(
            Some("test-id".to_string()),
            "Something went wrong".to_string(),
        );

        let json = serialize_response(&response).unwrap();
        assert!(json.contains("error"));
        assert!(json.contains("Something went wrong"));
    }
}
