// client.rs — BridgeClient: the host's side of the command bridge.
//
// Two-state readiness machine:
//
//   NotReady ──registry_ready──▶ Ready
//       │
//       └────registry_failed──▶ Failed(error)
//
// While NotReady, calls are queued; on `registry_ready` the queue is
// replayed in issue order before any newer call is sent. On
// `registry_failed` every queued call is rejected with the init error, and
// so is every later call. Each call waits on a oneshot keyed by its
// request id and fails with `Timeout` after the configured interval.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use redstring_sync::StatusEvent;

use crate::error::BridgeError;
use crate::protocol::{Command, CommandMessage, ServerMessage};

/// Default client-side timeout for one command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type Reply = Result<Value, BridgeError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    NotReady,
    Ready,
    Failed(String),
}

struct ClientState {
    readiness: Readiness,
    queued: VecDeque<CommandMessage>,
    pending: HashMap<String, oneshot::Sender<Reply>>,
}

struct ClientInner {
    outbound: mpsc::Sender<CommandMessage>,
    state: Mutex<ClientState>,
    // Held while sending so replayed commands go out before newer ones.
    send_lock: tokio::sync::Mutex<()>,
    status: broadcast::Sender<StatusEvent>,
    timeout: Duration,
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reject(&self, id: &str, error: BridgeError) {
        if let Some(tx) = self.lock().pending.remove(id) {
            let _ = tx.send(Err(error));
        }
    }

    async fn send(&self, msg: CommandMessage) {
        let id = msg.id.clone();
        if self.outbound.send(msg).await.is_err() {
            self.reject(&id, BridgeError::ChannelClosed);
        }
    }

    async fn handle(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Response(response) => {
                let id = response.id.clone();
                let tx = self.lock().pending.remove(&id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(response.into_result().map_err(BridgeError::Remote));
                    }
                    None => tracing::debug!(id = %id, "response for unknown or expired request"),
                }
            }
            ServerMessage::Status(StatusEvent::RegistryReady) => self.on_ready().await,
            ServerMessage::Status(StatusEvent::RegistryFailed { error }) => self.on_failed(error),
            ServerMessage::Status(event) => {
                // No subscribers is fine.
                let _ = self.status.send(event);
            }
        }
    }

    async fn on_ready(&self) {
        let _send = self.send_lock.lock().await;
        let replay: Vec<CommandMessage> = {
            let mut state = self.lock();
            if state.readiness == Readiness::Ready {
                return;
            }
            state.readiness = Readiness::Ready;
            state.queued.drain(..).collect()
        };
        tracing::info!(replayed = replay.len(), "registry ready");
        for msg in replay {
            self.send(msg).await;
        }
        let _ = self.status.send(StatusEvent::RegistryReady);
    }

    fn on_failed(&self, error: String) {
        let rejected: Vec<oneshot::Sender<Reply>> = {
            let mut state = self.lock();
            state.readiness = Readiness::Failed(error.clone());
            let queued: Vec<CommandMessage> = state.queued.drain(..).collect();
            queued
                .iter()
                .filter_map(|msg| state.pending.remove(&msg.id))
                .collect()
        };
        tracing::error!(error = %error, rejected = rejected.len(), "registry failed to initialize");
        for tx in rejected {
            let _ = tx.send(Err(BridgeError::InitFailed(error.clone())));
        }
        let _ = self.status.send(StatusEvent::RegistryFailed { error });
    }

    fn on_closed(&self) {
        let pending: Vec<oneshot::Sender<Reply>> = {
            let mut state = self.lock();
            state.queued.clear();
            state.pending.drain().map(|(_, tx)| tx).collect()
        };
        if !pending.is_empty() {
            tracing::warn!(pending = pending.len(), "bridge closed with requests in flight");
        }
        for tx in pending {
            let _ = tx.send(Err(BridgeError::ChannelClosed));
        }
    }
}

/// Cloneable handle for issuing commands to the registry.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<ClientInner>,
}

impl BridgeClient {
    /// Wire a client to a pair of channels and spawn the task that routes
    /// inbound messages. The task ends when `inbound` closes.
    pub fn connect(
        outbound: mpsc::Sender<CommandMessage>,
        mut inbound: mpsc::Receiver<ServerMessage>,
        timeout: Duration,
    ) -> Self {
        let (status, _) = broadcast::channel(64);
        let inner = Arc::new(ClientInner {
            outbound,
            state: Mutex::new(ClientState {
                readiness: Readiness::NotReady,
                queued: VecDeque::new(),
                pending: HashMap::new(),
            }),
            send_lock: tokio::sync::Mutex::new(()),
            status,
            timeout,
        });

        let router = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                router.handle(msg).await;
            }
            router.on_closed();
            tracing::debug!("bridge client router exited");
        });

        Self { inner }
    }

    pub fn readiness(&self) -> Readiness {
        self.inner.lock().readiness.clone()
    }

    /// Commands waiting for readiness.
    pub fn queued(&self) -> usize {
        self.inner.lock().queued.len()
    }

    /// Status pushes other than readiness transitions are forwarded here;
    /// readiness transitions are re-broadcast after the client has acted on them.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status.subscribe()
    }

    /// Issue a raw command and wait for its result.
    pub async fn call(&self, command: &str, payload: Value) -> Result<Value, BridgeError> {
        let msg = CommandMessage::new(command, payload);
        let id = msg.id.clone();
        let (tx, rx) = oneshot::channel();

        let send_now = {
            let mut state = self.inner.lock();
            if let Readiness::Failed(error) = &state.readiness {
                return Err(BridgeError::InitFailed(error.clone()));
            }
            let ready = state.readiness == Readiness::Ready;
            state.pending.insert(id.clone(), tx);
            if ready {
                Some(msg)
            } else {
                tracing::debug!(command, id = %id, "registry not ready; queuing command");
                state.queued.push_back(msg);
                None
            }
        };
        if let Some(msg) = send_now {
            let _send = self.inner.send_lock.lock().await;
            self.inner.send(msg).await;
        }

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(BridgeError::ChannelClosed),
            Err(_) => {
                {
                    let mut state = self.inner.lock();
                    state.pending.remove(&id);
                    state.queued.retain(|m| m.id != id);
                }
                let millis = self.inner.timeout.as_millis() as u64;
                tracing::warn!(command, id = %id, millis, "bridge command timed out");
                Err(BridgeError::Timeout {
                    command: command.to_string(),
                    millis,
                })
            }
        }
    }

    /// Issue a typed command and decode its result.
    pub async fn request<P, R>(&self, command: Command, payload: &P) -> Result<R, BridgeError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let value = self.call(command.as_str(), payload).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseMessage;
    use serde_json::json;

    fn pair(timeout: Duration) -> (BridgeClient, mpsc::Receiver<CommandMessage>, mpsc::Sender<ServerMessage>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        (BridgeClient::connect(out_tx, in_rx, timeout), out_rx, in_tx)
    }

    #[tokio::test]
    async fn queues_until_ready_then_replays_in_order() {
        let (client, mut out_rx, in_tx) = pair(Duration::from_secs(5));

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.call("getAllWorkspaces", Value::Null).await }
        });
        while client.queued() < 1 {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.call("getActiveWorkspace", Value::Null).await }
        });
        while client.queued() < 2 {
            tokio::task::yield_now().await;
        }
        assert!(out_rx.try_recv().is_err());

        in_tx
            .send(ServerMessage::Status(StatusEvent::RegistryReady))
            .await
            .unwrap();
        let a = out_rx.recv().await.unwrap();
        let b = out_rx.recv().await.unwrap();
        assert_eq!(a.command, "getAllWorkspaces");
        assert_eq!(b.command, "getActiveWorkspace");
        assert_eq!(client.readiness(), Readiness::Ready);

        in_tx
            .send(ServerMessage::Response(ResponseMessage::ok(&b.id, json!("b"))))
            .await
            .unwrap();
        in_tx
            .send(ServerMessage::Response(ResponseMessage::err(&a.id, "nope")))
            .await
            .unwrap();
        assert_eq!(second.await.unwrap().unwrap(), json!("b"));
        assert!(matches!(first.await.unwrap(), Err(BridgeError::Remote(m)) if m == "nope"));
    }

    #[tokio::test]
    async fn init_failure_rejects_queued_and_later_calls() {
        let (client, _out_rx, in_tx) = pair(Duration::from_secs(5));
        let queued = tokio::spawn({
            let client = client.clone();
            async move { client.call("getAllWorkspaces", Value::Null).await }
        });
        while client.queued() < 1 {
            tokio::task::yield_now().await;
        }

        in_tx
            .send(ServerMessage::Status(StatusEvent::RegistryFailed {
                error: "corrupt metadata".to_string(),
            }))
            .await
            .unwrap();
        assert!(matches!(queued.await.unwrap(), Err(BridgeError::InitFailed(e)) if e == "corrupt metadata"));

        let later = client.call("getAllWorkspaces", Value::Null).await;
        assert!(matches!(later, Err(BridgeError::InitFailed(_))));
        assert_eq!(client.queued(), 0);
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let (client, mut out_rx, in_tx) = pair(Duration::from_millis(20));
        in_tx
            .send(ServerMessage::Status(StatusEvent::RegistryReady))
            .await
            .unwrap();
        while client.readiness() != Readiness::Ready {
            tokio::task::yield_now().await;
        }

        let err = client.call("forceSave", json!({})).await.unwrap_err();
        assert!(err.is_timeout());
        // The request did go out; its late answer is ignored.
        let sent = out_rx.recv().await.unwrap();
        in_tx
            .send(ServerMessage::Response(ResponseMessage::ok(&sent.id, Value::Null)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn status_pushes_reach_subscribers() {
        let (client, _out_rx, in_tx) = pair(Duration::from_secs(5));
        let mut status = client.subscribe_status();
        in_tx
            .send(ServerMessage::Status(StatusEvent::RemoteReloaded {
                slug: "alpha".to_string(),
            }))
            .await
            .unwrap();
        let event = status.recv().await.unwrap();
        assert_eq!(event.event_type(), "remote_reloaded");
    }

    #[tokio::test]
    async fn closed_inbound_rejects_pending() {
        let (client, _out_rx, in_tx) = pair(Duration::from_secs(5));
        let queued = tokio::spawn({
            let client = client.clone();
            async move { client.call("getAllWorkspaces", Value::Null).await }
        });
        while client.queued() < 1 {
            tokio::task::yield_now().await;
        }
        drop(in_tx);
        assert!(matches!(queued.await.unwrap(), Err(BridgeError::ChannelClosed)));
    }
}
