// protocol.rs — Wire types for the command bridge.
//
// Host → registry:   { "command": "forceSave", "payload": {...}, "id": "<uuid>" }
// Registry → host:   { "channel": "response-<uuid>", "id": "<uuid>", "result": ... }
//                    { "channel": "response-<uuid>", "id": "<uuid>", "error": "..." }
//                    { "type": "commit_succeeded", "status": {...} }
//
// Status pushes are `StatusEvent`s. `registry_ready` / `registry_failed`
// double as the readiness signal the client waits for.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use redstring_document::GraphSnapshot;
use redstring_storage::RepoRef;
use redstring_sync::StatusEvent;
use redstring_workspace::{DiscoveredWorkspace, WorkspaceOptions, WorkspaceUpdate};

/// Every command the registry answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    GetAllWorkspaces,
    GetActiveWorkspace,
    CreateWorkspace,
    UpdateWorkspace,
    DeleteWorkspace,
    SwitchActiveWorkspace,
    SaveActiveWorkspace,
    ForceSave,
    DiscoverWorkspaces,
    LinkDiscoveredWorkspace,
    RelinkLocalFile,
    GetSyncStatus,
}

impl Command {
    pub const ALL: [Command; 12] = [
        Command::GetAllWorkspaces,
        Command::GetActiveWorkspace,
        Command::CreateWorkspace,
        Command::UpdateWorkspace,
        Command::DeleteWorkspace,
        Command::SwitchActiveWorkspace,
        Command::SaveActiveWorkspace,
        Command::ForceSave,
        Command::DiscoverWorkspaces,
        Command::LinkDiscoveredWorkspace,
        Command::RelinkLocalFile,
        Command::GetSyncStatus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Command::GetAllWorkspaces => "getAllWorkspaces",
            Command::GetActiveWorkspace => "getActiveWorkspace",
            Command::CreateWorkspace => "createWorkspace",
            Command::UpdateWorkspace => "updateWorkspace",
            Command::DeleteWorkspace => "deleteWorkspace",
            Command::SwitchActiveWorkspace => "switchActiveWorkspace",
            Command::SaveActiveWorkspace => "saveActiveWorkspace",
            Command::ForceSave => "forceSave",
            Command::DiscoverWorkspaces => "discoverWorkspaces",
            Command::LinkDiscoveredWorkspace => "linkDiscoveredWorkspace",
            Command::RelinkLocalFile => "relinkLocalFile",
            Command::GetSyncStatus => "getSyncStatus",
        }
    }

    pub fn parse(name: &str) -> Option<Command> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Command name. Kept as a string so unknown commands can be answered.
    pub command: String,
    #[serde(default)]
    pub payload: Value,
    pub id: String,
}

impl CommandMessage {
    pub fn new(command: impl Into<String>, payload: Value) -> Self {
        Self {
            command: command.into(),
            payload,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// The answer to one [`CommandMessage`], correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// `response-<id>`.
    pub channel: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseMessage {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        let id = id.into();
        Self {
            channel: response_channel(&id),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            channel: response_channel(&id),
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// An absent `result` without an `error` is a `null` result.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

pub fn response_channel(id: &str) -> String {
    format!("response-{}", id)
}

/// Anything the registry side writes back to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(ResponseMessage),
    Status(StatusEvent),
}

// ── Payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkspacePayload {
    pub name: String,
    #[serde(default)]
    pub options: WorkspaceOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWorkspacePayload {
    pub slug: String,
    #[serde(default)]
    pub updates: WorkspaceUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlugPayload {
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchPayload {
    pub slug: String,
    #[serde(default)]
    pub save_current: bool,
    #[serde(default)]
    pub snapshot: Option<GraphSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavePayload {
    /// Defaults to the active workspace.
    #[serde(default)]
    pub slug: Option<String>,
    pub snapshot: GraphSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoPayload {
    pub repo: RepoRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkPayload {
    pub discovered: DiscoveredWorkspace,
    pub repo: RepoRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelinkPayload {
    pub slug: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusPayload {
    /// All engines when absent.
    #[serde(default)]
    pub slug: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_names_round_trip() {
        for command in Command::ALL {
            assert_eq!(Command::parse(command.as_str()), Some(command));
            assert_eq!(
                serde_json::to_value(command).unwrap(),
                json!(command.as_str())
            );
        }
        assert_eq!(Command::parse("formatDisk"), None);
    }

    #[test]
    fn response_shapes() {
        let ok = serde_json::to_value(ResponseMessage::ok("7", json!({"a": 1}))).unwrap();
        assert_eq!(ok, json!({"channel": "response-7", "id": "7", "result": {"a": 1}}));

        let err = serde_json::to_value(ResponseMessage::err("8", "boom")).unwrap();
        assert_eq!(err, json!({"channel": "response-8", "id": "8", "error": "boom"}));
    }

    #[test]
    fn server_messages_are_distinguished_on_read() {
        let response: ServerMessage =
            serde_json::from_value(json!({"channel": "response-1", "id": "1", "result": null}))
                .unwrap();
        assert!(matches!(response, ServerMessage::Response(_)));

        let ready: ServerMessage = serde_json::from_value(json!({"type": "registry_ready"})).unwrap();
        assert_eq!(ready, ServerMessage::Status(StatusEvent::RegistryReady));

        let failed: ServerMessage = serde_json::from_value(
            json!({"type": "registry_failed", "status": {"error": "disk on fire"}}),
        )
        .unwrap();
        assert_eq!(
            failed,
            ServerMessage::Status(StatusEvent::RegistryFailed {
                error: "disk on fire".to_string()
            })
        );
    }

    #[test]
    fn command_payload_defaults_to_null() {
        let msg: CommandMessage =
            serde_json::from_value(json!({"command": "getAllWorkspaces", "id": "x"})).unwrap();
        assert_eq!(msg.payload, Value::Null);
    }
}
