//! Session multiplexer for interactive assistant CLIs.
//!
//! Each session owns one PTY process (normally a tmux session running the assistant),
//! keeps a bounded history of its output for late-joining viewers, fans that output out
//! to any number of subscribers, and derives a coarse status from the byte stream.

pub mod api;
pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod launch;
pub mod notify;
pub mod process;
pub mod registry;
pub mod session;
pub mod store;
pub mod subscriber;

#[cfg(test)]
mod testing;

pub use api::{build_router, AppState};
pub use config::Config;
pub use error::{SessionError, SessionResult};
pub use event::{Chunk, SessionEvent, StatusChange};
pub use registry::{Registry, StartRequest};
pub use session::{Session, SessionInfo};
pub use subscriber::{local_channel, Deliver, LocalReceiver, LocalSubscriber, WsSubscriber};
pub use tmuxdeck_terminal::Status;

pub const DEFAULT_PORT: u16 = 39383;
