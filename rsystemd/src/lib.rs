//! `rsystemd`: the shell-pool dispatcher daemon (`# 4.4`).
//!
//! Boots N background shells per `RSYSD_SHELLS`, binds a Unix domain
//! socket at `RSYS_SOCKET_PATH`, and serves `rsystem()` clients until
//! killed. Split into a library and a thin binary the way the teacher
//! splits `src-tauri/src/lib.rs` from `src-tauri/src/main.rs`, so
//! integration tests can drive [`dispatcher::run`] directly instead of
//! shelling out to the compiled binary.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod graceful_close;
pub mod shell;
