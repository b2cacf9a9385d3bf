//! Backend switchboard: selects which persistence backend the content
//! platform talks to, materializes its configuration, swaps the
//! application's entry files, migrates data between backends and rolls
//! back when validation fails.
//!
//! The crate is organized leaf-first. `profile` is the static registry of
//! supported backends; `config`, `probe`, `swap` and `migrate` are the
//! worker components; `orchestrator` composes them into the transactional
//! switch operation that the `switchboard` binary drives.

pub mod active;
pub mod config;
mod error;
pub mod fsops;
pub mod logging;
pub mod migrate;
pub mod orchestrator;
pub mod paths;
pub mod probe;
pub mod profile;
pub mod schema;
pub mod settings;
pub mod store;
pub mod swap;
pub mod txn;

pub use error::{AppError, AppResult};

/// Install the global tracing subscriber. Call once, early in `main`.
pub fn init_logging() {
    logging::init();
}
