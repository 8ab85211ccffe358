// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded worker pool for the command surface.
//!
//! Commands are queued on a bounded channel and picked up by a fixed number
//! of workers. The worker, not the caller, runs the handler, so a caller that
//! gives up waiting never aborts a mutation halfway.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{CommandHandlerState, Request, Response, handle_request};

/// Errors returned by [`CommandPool::submit`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Every worker has stopped.
    #[error("command pool is closed")]
    Closed,
    /// The worker dropped the reply channel.
    #[error("command worker dropped the reply")]
    Dropped,
}

struct Envelope {
    request: Request,
    reply: oneshot::Sender<Response>,
}

/// Handle for submitting commands to the workers.
#[derive(Clone)]
pub struct CommandPool {
    tx: mpsc::Sender<Envelope>,
}

impl CommandPool {
    /// Spawn `workers` tasks draining a queue of `queue_capacity` commands.
    ///
    /// Workers exit on shutdown or once every pool handle is dropped.
    pub fn start(
        state: Arc<CommandHandlerState>,
        workers: usize,
        queue_capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = workers.max(1);

        let handles = (0..workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    state.clone(),
                    rx.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        info!(workers, queue_capacity, "Command pool started");
        (Self { tx }, handles)
    }

    /// Queue a command and wait for its response.
    pub async fn submit(&self, request: Request) -> Result<Response, PoolError> {
        let (reply, response_rx) = oneshot::channel();

        self.tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| PoolError::Closed)?;

        response_rx.await.map_err(|_| PoolError::Dropped)
    }
}

async fn run_worker(
    worker_id: usize,
    state: Arc<CommandHandlerState>,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "Command worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let envelope = tokio::select! {
            biased;

            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown
                if changed.is_err() {
                    break;
                }
                continue;
            }

            envelope = async { rx.lock().await.recv().await } => envelope,
        };

        let Some(Envelope { request, reply }) = envelope else {
            break;
        };

        let op = request.op();
        let response = handle_request(&state, request).await;
        if reply.send(response).is_err() {
            warn!(worker_id, op, "Caller went away before the response was ready");
        }
    }

    debug!(worker_id, "Command worker stopped");
}
