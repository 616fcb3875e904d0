//! Episode sequencer: turns an ordered list of topics into a chain of
//! generation jobs, each one seeded by its predecessor's output.
//!
//! ## Overview
//!
//! Job 0 starts immediately. Job 1 starts as soon as job 0 is `ready` and
//! uses job 0's content as its continuation. Every later job `i` waits until
//! the consumer confirms job `i-1` (or a wait ceiling passes), so generation
//! stays roughly one episode ahead of playback. Finished jobs are delivered
//! exactly once through a pull snapshot or a push stream.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │ Consumer │ ───────> │  server.rs  (Router, purge task, shutdown)       │
//! │          │ <─────── │    └─ api.rs  (handlers, AppState, ApiError)     │
//! └──────────┘ SSE / WS │         │                   │                    │
//!                       │         │ create            │ confirm / stream   │
//!                       │         v                   v                    │
//!                       │  coordinator.rs        gate.rs   stream.rs ws.rs │
//!                       │   (watchers B, C)          │          │          │
//!                       │         │ launch           │          │          │
//!                       │         v                  │          │          │
//!                       │  runner.rs ──> collaborators.rs (generator,     │
//!                       │         │                   processors)          │
//!                       │         v                  v          v          │
//!                       │  store.rs  StateStore  (db.rs SQLite, memory.rs) │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                              |
//! |-----------|-------------------------------------------------------------|
//! | `models`  | `Sequence`, `JobStatus`, `JobResult`, status views          |
//! | `wait`    | `Timing` and the poll-or-notify `wait_until` helper         |
//! | `db`      | SQLite store behind `DbHandle` (`Arc<Mutex<_>>` + blocking) |
//! | `memory`  | In-process store with an availability switch                |

pub mod api;
pub mod collaborators;
pub mod coordinator;
pub mod db;
pub mod gate;
pub mod memory;
pub mod models;
pub mod runner;
pub mod server;
pub mod store;
pub mod stream;
pub mod wait;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;
