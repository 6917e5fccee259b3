//! Newline-delimited JSON bridge for the host command channel.
//!
//! Reads `CommandEnvelope` lines from an input stream, routes them through
//! the `HostCommandServer`, and writes `ResponseEnvelope` and
//! `EventEnvelope` lines to an output stream.
//!
//! When bridged to stdio, stdout is reserved for the protocol; diagnostics
//! go to stderr.

use crate::error::{AlarmError, Result};
use crate::host::channel::{AlarmHost, HostCommandClient, command_channel_with_events};
use crate::host::contract::{CommandEnvelope, CommandName, EventEnvelope, ResponseEnvelope};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{Mutex, broadcast};

/// Run the bridge over stdin/stdout until stdin closes or `host.stop`.
pub async fn run_stdio_bridge(
    host: AlarmHost,
    request_capacity: usize,
    event_tx: broadcast::Sender<EventEnvelope>,
) -> Result<()> {
    run_bridge(
        BufReader::new(tokio::io::stdin()),
        BufWriter::new(tokio::io::stdout()),
        host,
        request_capacity,
        event_tx,
    )
    .await
}

/// Run the bridge over arbitrary streams.
///
/// Three tasks cooperate:
///
/// 1. **Reader** (this task) parses each line, sends it through the client
///    and writes the response.
/// 2. **Event forwarder** writes every broadcast event as a line.
/// 3. **Server** runs the command router.
///
/// The bridge returns when the reader finishes. Dropping the client lets
/// the server drain and exit.
pub async fn run_bridge<R, W>(
    input: R,
    output: W,
    host: AlarmHost,
    request_capacity: usize,
    event_tx: broadcast::Sender<EventEnvelope>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (client, server) = command_channel_with_events(request_capacity, event_tx, host);
    let writer = Arc::new(Mutex::new(output));

    let server_handle = tokio::spawn(server.run());

    let event_writer = Arc::clone(&writer);
    let mut event_rx = client.subscribe_events();
    let event_handle = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        let mut w = event_writer.lock().await;
                        if let Err(e) = write_line(&mut *w, &json).await {
                            tracing::warn!(
                                error = %e,
                                "failed to write event envelope; stopping event forwarder"
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize event envelope; skipping");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "event forwarder lagged; some events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event broadcast channel closed; stopping event forwarder");
                    break;
                }
            }
        }
    });

    let reader_result = run_reader(input, client, Arc::clone(&writer)).await;

    event_handle.abort();
    let _ = event_handle.await;
    let _ = server_handle.await;

    reader_result
}

async fn run_reader<R, W>(mut input: R, client: HostCommandClient, writer: Arc<Mutex<W>>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = input
            .read_line(&mut line)
            .await
            .map_err(|e| AlarmError::Channel(format!("failed to read command stream: {e}")))?;

        if bytes_read == 0 {
            tracing::info!("command stream closed (EOF); shutting down bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(trimmed) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "failed to parse command envelope");
                let response = ResponseEnvelope::error(
                    "parse-error",
                    format!("failed to parse command envelope: {e}"),
                );
                let json = serde_json::to_string(&response)?;
                let mut w = writer.lock().await;
                write_line(&mut *w, &json).await?;
                continue;
            }
        };

        let request_id = envelope.request_id.clone();
        let is_stop = envelope.command == CommandName::HostStop;

        let response = match client.send(envelope).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(error = %e, "host command dispatch failed");
                ResponseEnvelope::error(request_id, format!("dispatch failed: {e}"))
            }
        };

        let json = serde_json::to_string(&response)?;
        {
            let mut w = writer.lock().await;
            write_line(&mut *w, &json).await?;
        }

        if is_stop {
            tracing::info!("host.stop received; shutting down bridge");
            break;
        }
    }

    Ok(())
}

/// Write a single JSON line and flush.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<()> {
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| AlarmError::Channel(format!("failed to write line: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| AlarmError::Channel(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| AlarmError::Channel(format!("failed to flush output: {e}")))?;
    Ok(())
}
