// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call-Flow Core - Action Graph Execution Engine
//!
//! This crate compiles authored call flows into linked action graphs and
//! drives one live instance of a flow (an *activeflow*) per call, message or
//! conversation. A call driver repeatedly asks for the next action; the core
//! answers with exactly one action per request, or reports that the
//! activeflow has finished.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │              Call drivers / management clients                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ TCP, length-prefixed JSON frames
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │   server  ──►  pool (N workers)  ──►  command::handle_request           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                              │
//!           ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │   FlowHandler         │◄───────────────────│   ActiveflowHandler         │
//! │   (flow store)        │   reads templates  │   (engine, stack map)       │
//! └───────────────────────┘                    └─────────────────────────────┘
//!           │                                              │
//!           ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │ SQLite  +  TTL cache  │                    │ EventPublisher / CallDriver │
//! └───────────────────────┘                    └─────────────────────────────┘
//! ```
//!
//! # Activeflow Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `CreateActiveflow` | Snapshot a flow's actions into a new running activeflow |
//! | `NextAction` | Resolve and hand out the next action |
//! | `SetForwardAction` | Redirect the next resolution, optionally resolving now |
//! | `Execute` / `ExecuteContinue` | Detached driver notification; continue requires a `block` |
//! | `PushActions` | Push a nested frame whose first action runs next |
//! | `AddActions` | Splice actions after the current one |
//! | `Stop` | Mark the activeflow stopped (idempotent) |
//! | `ServiceStop` | Remove the frames a service pushed |
//! | `Get` / `List` / `Delete` | Read and soft-delete |
//!
//! # Stack Map
//!
//! Every activeflow owns a tree of frames keyed by stack id. The main frame
//! (`STACK_ID_MAIN`) holds the flow's actions; pushed frames record where to
//! return once exhausted. Resolution walks the current frame, pops exhausted
//! frames and, when the main frame runs out, either splices in the
//! on-complete flow or completes the activeflow.
//!
//! # Status State Machine
//!
//! ```text
//!                 ┌─────────┐
//!                 │ RUNNING │───────────────┐
//!                 └────┬────┘               │
//!                      │                    │
//!      stop / stop action            main frame exhausted,
//!                      │             no on-complete flow
//!                      ▼                    ▼
//!                 ┌─────────┐         ┌───────────┐
//!                 │ STOPPED │         │ COMPLETED │
//!                 └─────────┘         └───────────┘
//! ```
//!
//! Both terminal states are final: every mutating operation on them fails
//! with [`CoreError::Terminal`](error::CoreError::Terminal), except `Stop`
//! which is a no-op.
//!
//! # Consistency
//!
//! Each mutation is a read-modify-write guarded by a version column. A lost
//! compare-and-set is retried once from a fresh read, then reported as
//! `CONFLICT`. A resolution that exceeds the execute-count ceiling fails with
//! `LOOP_DETECTED` and writes nothing.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CALLFLOW_DATABASE_URL` | Yes | - | SQLite URL or file path |
//! | `CALLFLOW_PORT` | No | `9010` | Command server port |
//! | `CALLFLOW_MAX_EXECUTE_COUNT` | No | `100` | Loop guard ceiling |
//! | `CALLFLOW_MAX_FLOWS_PER_CUSTOMER` | No | `10000` | Persisted flow ceiling |
//! | `CALLFLOW_REQUEST_TIMEOUT_MS` | No | `3000` | Store deadline |
//! | `CALLFLOW_TEMP_FLOW_TTL_SECS` | No | `86400` | Temporary flow lifetime |
//! | `CALLFLOW_WORKERS` | No | `16` | Command workers |

#![deny(missing_docs)]

/// Action model, action types and sentinel ids.
pub mod action;

/// Activeflow record, status and reference types.
pub mod activeflow;

/// Activeflow engine: resolution, forwarding, frames and lifecycle.
pub mod activeflow_handlers;

/// Command requests, responses and dispatch.
pub mod command;

/// Action graph compiler.
pub mod compiler;

/// Server configuration loaded from environment variables.
pub mod config;

/// Outbound call driver notifications.
pub mod driver;

/// Error types with command error code mapping.
pub mod error;

/// Lifecycle events and publishers.
pub mod events;

/// Flow template model.
pub mod flow;

/// Flow store handlers.
pub mod flow_handlers;

/// Length-prefixed frame codec for the command transport.
pub mod frame;

/// Embedded database migrations.
pub mod migrations;

/// Storage backends and the temporary flow cache.
pub mod persistence;

/// Command worker pool.
pub mod pool;

/// Embeddable runtime.
pub mod runtime;

/// TCP command server.
pub mod server;

/// Per-activeflow stack map.
pub mod stack;

pub use error::{CoreError, Result};
