//! Transport abstraction for the Quiz Clash battle protocol.
//!
//! The [`Transport`] trait defines the single authenticated, long-lived
//! bidirectional channel the session core runs on. The protocol uses JSON
//! text messages, so every transport implementation must handle message
//! framing internally (WebSocket frames, length-prefixed TCP, QUIC streams).
//!
//! # Connection Setup
//!
//! Connection setup is intentionally NOT part of this trait — different
//! transports have fundamentally different connection parameters (URLs for
//! WebSocket, host:port for TCP, QUIC endpoints, etc.). Construct a connected
//! transport externally, then pass it to `QuizClashClient::start`. The same
//! goes for reconnection policy: it belongs to the transport layer, not to
//! the session core.

use async_trait::async_trait;

use crate::error::QuizClashError;

/// A bidirectional text message transport for the Quiz Clash protocol.
///
/// Implementors shuttle serialized JSON strings between the client and server.
/// Each call to [`send`](Transport::send) transmits one complete JSON message.
/// Each call to [`recv`](Transport::recv) returns one complete JSON message,
/// in server-emission order — the session core relies on ordered delivery and
/// treats reordering as a protocol violation.
///
/// # Object Safety
///
/// This trait is object-safe, so `Box<dyn Transport>` works for dynamic
/// dispatch. `QuizClashClient::start` accepts `impl Transport` (monomorphized)
/// for the common case.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is
/// used inside `tokio::select!`. If `recv` is cancelled before completion,
/// calling it again must not lose data. Channel-based implementations (e.g.,
/// wrapping `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::TransportSend`] if the message could not be
    /// sent (e.g., connection broken, write buffer full).
    async fn send(&mut self, message: String) -> Result<(), QuizClashError>;

    /// Receive the next JSON text message from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))` — a complete message was received
    /// - `Some(Err(e))` — a transport error occurred
    /// - `None` — the connection was closed cleanly by the server
    ///
    /// # Cancel Safety
    ///
    /// This method **MUST** be cancel-safe (see [trait documentation](Transport)).
    async fn recv(&mut self) -> Option<Result<String, QuizClashError>>;

    /// Close the transport connection gracefully.
    ///
    /// After calling this method, subsequent calls to [`send`](Transport::send)
    /// and [`recv`](Transport::recv) may return errors or `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), QuizClashError>;
}
