//! # Quiz Clash Client
//!
//! Transport-agnostic Rust client for the Quiz Clash real-time trivia
//! battle protocol.
//!
//! This crate provides a high-level async client that keeps a battle
//! session, a multiplayer room lobby, and the user's social graph in sync
//! with the game server over any bidirectional JSON text transport.
//!
//! ## Features
//!
//! - **Transport-agnostic** — implement the [`Transport`] trait for any backend
//! - **Event-driven** — receive typed [`QuizClashEvent`]s via a channel
//! - **Timed reveal flow** — the previous answer is shown for a configurable
//!   window before the next question is applied
//! - **Optimistic social mutations** — friend-graph actions apply locally
//!   first and roll back exactly if the server rejects them
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use quiz_clash_client::{QuizClashClient, QuizClashConfig, QuizClashEvent};
//!
//! let transport = connect_somehow().await;
//! let config = QuizClashConfig::new(my_player_id, "session-token");
//! let (client, mut events) = QuizClashClient::start(transport, config);
//!
//! client.find_match()?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         QuizClashEvent::QuestionPosted { question, .. } => { /* render */ }
//!         QuizClashEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

pub mod battle;
pub mod client;
pub mod error;
pub mod event;
pub mod protocol;
pub mod room;
pub mod social;
pub mod timer;
pub mod transport;

// Re-export primary types for ergonomic imports.
pub use client::{QuizClashClient, QuizClashConfig};
pub use error::QuizClashError;
pub use event::QuizClashEvent;
pub use protocol::{ClientMessage, ServerMessage};
pub use transport::Transport;
