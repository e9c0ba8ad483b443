//! # Ingest Agent
//!
//! A document-ingestion agent that keeps a remote Ingester in step with
//! source repositories. It collects files and issues from GitHub- or
//! Gitea-style hosts (plus local directory trees), diffs them against the
//! Ingester's content hashes, and uploads only what changed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌────────────┐
//! │  Collectors  │──▶│ Sync engine  │──▶│  Ingester  │
//! │ SCM / FS     │   │ hash + commit│   │  (remote)  │
//! └──────────────┘   │ reconcile    │   └─────┬──────┘
//!                    └──────────────┘         │
//!                      ▲                      ▼
//!                 ┌──────────┐          ┌──────────┐
//!                 │   CLI    │          │ sync     │
//!                 │ (iagent) │          │ cursors  │
//!                 └──────────┘          └──────────┘
//! ```
//!
//! Two sync strategies exist. A **full inventory** enumerates everything at
//! the source and lets the Ingester's hash comparison decide what to upload.
//! An **incremental sync** walks the commits since the stored cursor and
//! touches only the files those commits changed; it falls back to the full
//! pass for a source that has never synced.
//!
//! ## Quick Start
//!
//! ```bash
//! iagent scm run-inventory --scm gitea --owner admin --repo docs
//! iagent scm incremental-sync --scm gitea --owner admin --repo docs
//! iagent scm get-sync-state --scm gitea --owner admin --repo docs
//! iagent fs run-inventory
//! iagent serve                  # start the agent API server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | SCM error taxonomy |
//! | [`transport`] | HTTP transport seam |
//! | [`retry`] | Retry / backoff / rate-limit policy |
//! | [`scm`] | GitHub/Gitea provider |
//! | [`ingester`] | Remote Ingester client |
//! | [`sync`] | Inventory and incremental-sync engine |
//! | [`collector_fs`] | Local filesystem collector |
//! | [`auth`] | API authentication |
//! | [`server`] | Agent HTTP API |

pub mod auth;
pub mod collector_fs;
pub mod config;
pub mod error;
pub mod ingester;
pub mod models;
pub mod retry;
pub mod scm;
pub mod server;
pub mod sync;
pub mod transport;
