// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP command server.
//!
//! Accepts connections and answers each request frame with one response
//! frame. A connection may carry any number of sequential requests. The
//! commands themselves run on the [`CommandPool`].

use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::command::{Request, Response};
use crate::frame::{FrameError, FramedStream, MessageType};
use crate::pool::CommandPool;

/// Bind `bind_addr` and serve until shutdown.
pub async fn run_command_server(
    bind_addr: SocketAddr,
    pool: CommandPool,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    serve(listener, pool, shutdown_rx).await
}

/// Serve an already bound listener until shutdown.
pub async fn serve(
    listener: TcpListener,
    pool: CommandPool,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "Command server starting");

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Command server received shutdown signal");
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        let pool = pool.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, remote_addr, pool, shutdown_rx).await;
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    info!("Command server stopped");
    Ok(())
}

/// Handle a single connection
#[instrument(skip(stream, pool, shutdown_rx), fields(remote = %remote_addr))]
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    pool: CommandPool,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!("Connection accepted");
    let mut framed = FramedStream::new(stream);

    loop {
        let frame = tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break,

            frame = framed.read_frame() => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => break,
            Err(e) => {
                warn!("Failed to read frame: {}", e);
                break;
            }
        };

        if frame.message_type != MessageType::Request {
            warn!(message_type = ?frame.message_type, "Ignoring non-request frame");
            continue;
        }

        let response = match frame.decode::<Request>() {
            Ok(request) => match pool.submit(request).await {
                Ok(response) => response,
                Err(e) => {
                    error!("Command pool unavailable: {}", e);
                    Response::Error {
                        code: "UNAVAILABLE".to_string(),
                        message: e.to_string(),
                    }
                }
            },
            Err(e) => {
                debug!("Malformed request: {}", e);
                Response::Error {
                    code: "VALIDATION_ERROR".to_string(),
                    message: format!("malformed request: {e}"),
                }
            }
        };

        if let Err(e) = framed.respond(&response).await {
            warn!("Failed to write response: {}", e);
            break;
        }
    }

    debug!("Connection closed");
}
