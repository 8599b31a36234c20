// transport.rs — Newline-delimited JSON framing for the bridge.
//
// One JSON object per line in each direction. The daemon serves stdin /
// stdout; tests wire both ends over `tokio::io::duplex`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::client::BridgeClient;
use crate::error::BridgeError;
use crate::protocol::{CommandMessage, ResponseMessage, ServerMessage};
use crate::server::BridgeServer;

const CHANNEL_CAPACITY: usize = 256;

/// Serve commands read from `reader`, writing responses and status pushes
/// to `writer`. Returns after `reader` hits EOF and every queued message
/// has been written.
pub async fn serve_lines<R, W>(
    server: Arc<BridgeServer>,
    reader: R,
    writer: W,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel::<CommandMessage>(CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(CHANNEL_CAPACITY);

    let writer_task = tokio::spawn(write_lines(writer, out_rx));

    let reject = out_tx.clone();
    let reader_task = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "bridge input read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CommandMessage>(&line) {
                Ok(msg) => {
                    if cmd_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed bridge command");
                    // Answer when the line at least carries an id.
                    if let Some(id) = salvage_id(&line) {
                        let response = ResponseMessage::err(id, format!("malformed command: {}", e));
                        let _ = reject.send(ServerMessage::Response(response)).await;
                    }
                }
            }
        }
    });

    server.serve(cmd_rx, out_tx).await;

    if let Err(e) = reader_task.await {
        tracing::warn!(error = %e, "bridge reader task failed");
    }
    match writer_task.await {
        Ok(result) => result,
        Err(e) => Err(BridgeError::Io(std::io::Error::other(e))),
    }
}

/// Connect a client to a registry speaking JSON lines on the other end of
/// `reader` / `writer`.
pub fn connect_lines<R, W>(reader: R, writer: W, timeout: Duration) -> BridgeClient
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel::<CommandMessage>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<ServerMessage>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        if let Err(e) = write_lines(writer, cmd_rx).await {
            tracing::warn!(error = %e, "bridge client writer stopped");
        }
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ServerMessage>(&line) {
                Ok(msg) => {
                    if in_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "malformed bridge message"),
            }
        }
    });

    BridgeClient::connect(cmd_tx, in_rx, timeout)
}

async fn write_lines<W, T>(mut writer: W, mut rx: mpsc::Receiver<T>) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    while let Some(msg) = rx.recv().await {
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}

fn salvage_id(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}
