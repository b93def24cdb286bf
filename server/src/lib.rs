//! Oppi stream server: multiplexes session supervisors to remote clients
//! over newline-delimited JSON frames.
//!
//! Transport, authentication and pairing are owned by the embedding
//! process; this crate serves an already-authenticated byte stream. The
//! agent engine is injected through `oppi_core::engine::EngineFactory`.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod mux;
mod outgoing;

pub use mux::ClientConnection;
pub use mux::MuxConfig;
pub use outgoing::OutgoingSender;

use std::io::Result as IoResult;
use std::sync::Arc;

use oppi_core::SessionRegistry;
use oppi_protocol::ServerMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Install a stderr subscriber so `tracing` output is visible. The log
/// level is controlled with `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

/// Serve one client connection over a line-framed byte stream. Returns when
/// the peer disconnects, the outbound queue overflows, or liveness fails.
/// Sessions keep running either way.
pub async fn serve_connection<R, W>(
    registry: Arc<SessionRegistry>,
    reader: R,
    writer: W,
    config: MuxConfig,
) -> IoResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ServerMessage>(config.outbound_capacity);
    let disconnect = CancellationToken::new();
    let connection = Arc::new(ClientConnection::new(
        registry,
        OutgoingSender::new(outgoing_tx, disconnect.clone()),
        disconnect.clone(),
    ));

    // Task: drain the outbound queue to the peer.
    let writer_handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = outgoing_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if writer.write_all(json.as_bytes()).await.is_err() {
                        break;
                    }
                    if writer.write_all(b"\n").await.is_err() {
                        break;
                    }
                    if writer.flush().await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to serialize server message: {e}"),
            }
        }
        debug!("writer task exited");
    });

    // Task: liveness pings.
    let ping_handle = tokio::spawn(
        connection
            .clone()
            .ping_loop(config.ping_interval, config.max_missed_pongs),
    );

    // Inbound frames, demuxed inline.
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = disconnect.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => connection.handle_frame(&line).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("read error: {e}");
                    break;
                }
            }
        }
    }

    info!("client connection closed");
    connection.teardown().await;
    ping_handle.abort();
    drop(connection);
    let _ = writer_handle.await;
    Ok(())
}

/// Serve a single connection on stdio. The embedding process owns process
/// lifetime and transport.
pub async fn serve_stdio(registry: Arc<SessionRegistry>, config: MuxConfig) -> IoResult<()> {
    serve_connection(registry, tokio::io::stdin(), tokio::io::stdout(), config).await
}
