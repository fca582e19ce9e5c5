//! Core session layer for the Tic-Tac-Toe network game server: the
//! wire-framed protocol, the Tic-Tac-Toe engine, player/Elo tracking, the
//! client and player registries, the invitation state machine, and the
//! per-connection session loop.
//!
//! The TCP accept loop, CLI, and signal plumbing live in `src/bin/server.rs`
//! — this crate is the part that has invariants worth unit-testing
//! independent of any particular listener.

pub mod client_registry;
pub mod client_session;
pub mod error;
pub mod game;
pub mod invitation;
pub mod logger;
pub mod player;
pub mod player_registry;
pub mod protocol;
pub mod session_loop;
