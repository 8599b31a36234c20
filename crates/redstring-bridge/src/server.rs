// server.rs — BridgeServer: answers bridge commands against a registry.
//
// `serve` forwards every status event to the host, initializes the
// registry (which announces readiness or failure as a status event), then
// handles commands one at a time in arrival order. Every command gets
// exactly one response; failures become `{error}` responses rather than
// tearing the loop down.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use redstring_sync::{StatusEvent, StatusSink, SyncError};
use redstring_workspace::{SwitchOptions, WorkspaceRegistry};

use crate::error::BridgeError;
use crate::protocol::{
    Command, CommandMessage, CreateWorkspacePayload, LinkPayload, RelinkPayload, RepoPayload,
    ResponseMessage, SavePayload, ServerMessage, SlugPayload, SwitchPayload, SyncStatusPayload,
    UpdateWorkspacePayload,
};

/// Pushes status events onto the outbound message channel. Holds a weak
/// sender so the channel closes once `serve` returns.
struct ForwardingSink {
    tx: mpsc::WeakSender<ServerMessage>,
}

impl StatusSink for ForwardingSink {
    fn send(&self, event: &StatusEvent) -> Result<(), SyncError> {
        let tx = self
            .tx
            .upgrade()
            .ok_or_else(|| SyncError::Sink("bridge closed".to_string()))?;
        tx.try_send(ServerMessage::Status(event.clone()))
            .map_err(|e| SyncError::Sink(format!("bridge status push failed: {}", e)))
    }
}

pub struct BridgeServer {
    registry: Arc<WorkspaceRegistry>,
}

impl BridgeServer {
    pub fn new(registry: Arc<WorkspaceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }

    /// Run until `commands` closes, then stop the registry's sync engines.
    pub async fn serve(
        &self,
        mut commands: mpsc::Receiver<CommandMessage>,
        outbound: mpsc::Sender<ServerMessage>,
    ) {
        self.registry.events().add_sink(Box::new(ForwardingSink {
            tx: outbound.downgrade(),
        }));

        // The outcome reaches the host as registry_ready / registry_failed.
        if let Err(e) = self.registry.initialize().await {
            tracing::error!(error = %e, "registry initialization failed");
        }

        while let Some(msg) = commands.recv().await {
            let response = self.handle(msg).await;
            if outbound.send(ServerMessage::Response(response)).await.is_err() {
                tracing::warn!("bridge outbound closed; stopping");
                break;
            }
        }

        self.registry.shutdown();
        tracing::info!("bridge server stopped");
    }

    /// Answer one command.
    pub async fn handle(&self, msg: CommandMessage) -> ResponseMessage {
        let CommandMessage {
            command,
            payload,
            id,
        } = msg;
        tracing::debug!(command = %command, id = %id, "bridge command");
        match self.dispatch(&command, payload).await {
            Ok(result) => ResponseMessage::ok(id, result),
            Err(e) => {
                tracing::warn!(command = %command, id = %id, error = %e, "bridge command failed");
                ResponseMessage::err(id, e.to_string())
            }
        }
    }

    async fn dispatch(&self, name: &str, payload: Value) -> Result<Value, BridgeError> {
        let command =
            Command::parse(name).ok_or_else(|| BridgeError::UnknownCommand(name.to_string()))?;
        let registry = &self.registry;

        match command {
            Command::GetAllWorkspaces => to_value(registry.get_all_workspaces()),
            Command::GetActiveWorkspace => to_value(registry.get_active_workspace()?),
            Command::CreateWorkspace => {
                let p: CreateWorkspacePayload = parse(command, payload)?;
                to_value(registry.create_workspace(&p.name, p.options)?)
            }
            Command::UpdateWorkspace => {
                let p: UpdateWorkspacePayload = parse(command, payload)?;
                to_value(registry.update_workspace(&p.slug, p.updates)?)
            }
            Command::DeleteWorkspace => {
                let p: SlugPayload = parse(command, payload)?;
                registry.delete_workspace(&p.slug).await?;
                Ok(json!({ "deleted": p.slug, "active": registry.active_slug() }))
            }
            Command::SwitchActiveWorkspace => {
                let p: SwitchPayload = parse(command, payload)?;
                let snapshot = registry
                    .switch_active_workspace(
                        &p.slug,
                        SwitchOptions {
                            save_current: p.save_current,
                            snapshot: p.snapshot,
                        },
                    )
                    .await?;
                Ok(json!({
                    "workspace": registry.get_active_workspace()?,
                    "snapshot": snapshot,
                }))
            }
            Command::SaveActiveWorkspace => {
                let p: SavePayload = parse(command, payload)?;
                let report = match p.slug {
                    Some(slug) if slug != registry.active_slug() => {
                        return Err(BridgeError::InvalidPayload {
                            command: command.to_string(),
                            message: format!("'{}' is not the active workspace", slug),
                        });
                    }
                    _ => registry.save_active_workspace(&p.snapshot).await?,
                };
                to_value(report)
            }
            Command::ForceSave => {
                let p: SavePayload = parse(command, payload)?;
                let slug = p.slug.unwrap_or_else(|| registry.active_slug());
                to_value(registry.force_save(&slug, &p.snapshot).await?)
            }
            Command::DiscoverWorkspaces => {
                let p: RepoPayload = parse(command, payload)?;
                to_value(registry.discover_workspaces_in_repository(&p.repo).await?)
            }
            Command::LinkDiscoveredWorkspace => {
                let p: LinkPayload = parse(command, payload)?;
                to_value(registry.link_discovered_workspace(&p.discovered, &p.repo)?)
            }
            Command::RelinkLocalFile => {
                let p: RelinkPayload = parse(command, payload)?;
                to_value(registry.relink_local_file(&p.slug, &p.path)?)
            }
            Command::GetSyncStatus => {
                let p: SyncStatusPayload = if payload.is_null() {
                    SyncStatusPayload::default()
                } else {
                    parse(command, payload)?
                };
                match p.slug {
                    Some(slug) => to_value(registry.sync_status(&slug)?),
                    None => to_value(registry.all_sync_statuses()),
                }
            }
        }
    }
}

fn parse<T: DeserializeOwned>(command: Command, payload: Value) -> Result<T, BridgeError> {
    serde_json::from_value(payload).map_err(|e| BridgeError::InvalidPayload {
        command: command.to_string(),
        message: e.to_string(),
    })
}

fn to_value<T: Serialize>(value: T) -> Result<Value, BridgeError> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redstring_storage::{ManualClock, MemoryCacheBackend, MemoryHandleFactory};
    use redstring_workspace::RegistryConfig;

    fn server() -> BridgeServer {
        let registry = WorkspaceRegistry::builder(RegistryConfig::for_state_dir("/unused"))
            .clock(ManualClock::starting_now())
            .cache_backend(Arc::new(MemoryCacheBackend::new()))
            .handle_factory(Arc::new(MemoryHandleFactory::new()))
            .persist(false)
            .build()
            .unwrap();
        BridgeServer::new(Arc::new(registry))
    }

    fn msg(command: &str, payload: Value) -> CommandMessage {
        CommandMessage::new(command, payload)
    }

    #[tokio::test]
    async fn unknown_command_is_an_error_response() {
        let server = server();
        let request = msg("launchRockets", Value::Null);
        let id = request.id.clone();
        let response = server.handle(request).await;
        assert_eq!(response.id, id);
        assert_eq!(response.channel, format!("response-{}", id));
        assert!(response.result.is_none());
        assert!(response.error.unwrap().contains("launchRockets"));
    }

    #[tokio::test]
    async fn invalid_payload_names_the_command() {
        let server = server();
        let response = server
            .handle(msg("createWorkspace", json!({"options": {}})))
            .await;
        let error = response.error.unwrap();
        assert!(error.contains("createWorkspace"), "{error}");
    }

    #[tokio::test]
    async fn create_switch_save_and_status() {
        let server = server();
        let created = server
            .handle(msg("createWorkspace", json!({"name": "Alpha"})))
            .await
            .into_result()
            .unwrap();
        assert_eq!(created["slug"], "alpha");

        let switched = server
            .handle(msg("switchActiveWorkspace", json!({"slug": "alpha"})))
            .await
            .into_result()
            .unwrap();
        assert_eq!(switched["workspace"]["slug"], "alpha");

        let snapshot = json!({"nodes": [{"id": "n1", "name": "Thought"}]});
        let saved = server
            .handle(msg("saveActiveWorkspace", json!({"snapshot": snapshot})))
            .await
            .into_result()
            .unwrap();
        assert_eq!(saved["saved"], json!(["cache"]));

        let wrong = server
            .handle(msg(
                "saveActiveWorkspace",
                json!({"slug": "universe", "snapshot": {}}),
            ))
            .await;
        assert!(wrong.error.is_some());

        let statuses = server
            .handle(msg("getSyncStatus", Value::Null))
            .await
            .into_result()
            .unwrap();
        assert_eq!(statuses, json!([]));

        let deleted = server
            .handle(msg("deleteWorkspace", json!({"slug": "alpha"})))
            .await
            .into_result()
            .unwrap();
        assert_eq!(deleted["active"], "universe");
    }

    #[tokio::test]
    async fn registry_errors_become_error_responses() {
        let server = server();
        let response = server
            .handle(msg("deleteWorkspace", json!({"slug": "universe"})))
            .await;
        assert!(response.error.unwrap().contains("last one"));

        let response = server
            .handle(msg("discoverWorkspaces", json!({"repo": {"owner": "o", "name": "r"}})))
            .await;
        assert!(response.error.unwrap().contains("no remote provider"));
    }
}
