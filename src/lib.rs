//! Coverage Bot — automated unit-test generation for TypeScript repos.
//!
//! ## Overview
//!
//! A registered repository is scanned for per-file line coverage; on
//! request, the bot generates a jest test for a chosen source file inside a
//! sandboxed clone, validates that it compiles, runs, and lifts measured
//! coverage past the job's threshold, then pushes the file and opens a pull
//! request.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌─────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  api.rs    (axum router, AppState)              │
//! └──────────┘          │     │ entities + enqueue                        │
//!                       │     v                                           │
//!   API process         │  db.rs     (repo/job stores) ── queue.rs        │
//!  ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─│─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ │─ ─ ─ ─ ─ ─ ─│
//!   worker process      │                                   v             │
//!                       │  worker.rs (consumers: scan ×2, improve ×1)     │
//!                       │     │                  │                        │
//!                       │     v                  v                        │
//!                       │  scanner.rs        improve.rs                   │
//!                       │     │                  │ generator.rs           │
//!                       │     │                  │   └─ validator.rs      │
//!                       │     │                  │   └─ analyzer.rs       │
//!                       │     v                  v                        │
//!                       │  sandbox.rs (Docker: /app rw, /toolchain ro)    │
//!                       │  host.rs    (GitHub API + git CLI)              │
//!                       └─────────────────────────────────────────────────┘
//! ```
//!
//! | Module      | Responsibility                                          |
//! |-------------|---------------------------------------------------------|
//! | `models`    | `TrackedRepository`, `ImprovementJob`, `JobStatus`      |
//! | `db`        | SQLite stores behind `DbHandle` (`spawn_blocking`)      |
//! | `queue`     | Durable queues with job-key dedupe and bounded retry    |
//! | `sandbox`   | Ephemeral containers + host exec + toolchain bootstrap  |
//! | `host`      | Clone, branch, push, pull request, manifest inspection  |
//! | `analyzer`  | Constructor-dependency signatures for prompts           |
//! | `scanner`   | Install → run with coverage → summary or 0 % fallback   |
//! | `validator` | Scoped compile check + coverage-enforced execution      |
//! | `generator` | Prompt build, CLI invocation, bounded repair loop       |
//! | `improve`   | One job end-to-end with persisted status transitions    |
//! | `api`       | External command surface                                |
//! | `worker`    | Bootstrap + queue consumers                             |

pub mod analyzer;
pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod generator;
pub mod host;
pub mod improve;
pub mod models;
pub mod queue;
pub mod sandbox;
pub mod scanner;
pub mod validator;
pub mod worker;
