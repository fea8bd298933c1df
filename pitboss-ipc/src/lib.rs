//! Inter-process communication for Pitboss
//!
//! This crate provides the wire protocol spoken between the pool and its
//! worker processes: request/response messages, length-prefixed JSON framing,
//! and a worker-side request loop that worker binaries can build on.

pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    ResponseStatus, WorkerRequest, WorkerResponse, MAX_FRAME_BYTES, PING_COMMAND,
    SHUTDOWN_COMMAND,
};
pub use server::{serve, HandlerOutcome, ReferenceHandler, RequestHandler, ServeExit};
pub use transport::{encode_frame, FrameReader, FrameWriter};
