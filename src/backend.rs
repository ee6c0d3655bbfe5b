//! Platform transport contract.
//!
//! The core is transport-agnostic: anything that can move HCI packets to and
//! from a controller implements [`Backend`]. Outbound packets arrive through
//! `send_command`/`send_data` already framed (minus the transport's own
//! packet indicator); inbound packets are pushed into the [`EventSink`]
//! handed over at init time, from whatever context the transport owns.

use crate::buffer::Buffer;
use crate::queue::EventSink;
use core::fmt;

#[derive(Debug)]
pub enum BackendError {
    /// The transport was used before `init` or after `deinit`.
    NotInitialized,
    /// The device went away underneath the transport.
    TransportClosed,
    /// An OS-level I/O failure.
    Io(std::io::Error),
    Other(&'static str),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackendError::NotInitialized => write!(f, "transport is not initialized"),
            BackendError::TransportClosed => write!(f, "transport closed"),
            BackendError::Io(err) => write!(f, "transport I/O error: {}", err),
            BackendError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io(err)
    }
}

pub trait Backend {
    /// Bring the transport up. Inbound packets go through `sink` from here
    /// on; the sink may be cloned into reader threads or completion
    /// callbacks.
    fn init(&mut self, sink: EventSink) -> Result<(), BackendError>;

    /// Send an HCI command packet. The buffer is always contiguous.
    fn send_command(&mut self, buffer: Buffer) -> Result<(), BackendError>;

    /// Send one ACL fragment, already framed by the link layer.
    fn send_data(&mut self, buffer: Buffer) -> Result<(), BackendError>;

    /// Tear the transport down.
    fn deinit(&mut self) -> Result<(), BackendError>;
}
