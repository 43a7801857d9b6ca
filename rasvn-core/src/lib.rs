//! Rasvn Core Library
//!
//! Protocol layer for an svn-style version-control client/server:
//! - Byte stream abstraction (TCP, tunneled pipes)
//! - Buffered connection with blocked-write handling
//! - Self-describing item wire codec
//! - Authentication negotiation (CRAM-MD5, ANONYMOUS, EXTERNAL, pluggable)
//! - Tree-delta editor driving and replay, pipelined or not
//! - Session handshake (greeting, capabilities, repository announcement)
//! - Config store and hash dump/load collaborators

pub mod auth;
pub mod config;
pub mod conn;
pub mod editor;
pub mod error;
pub mod hashdump;
pub mod item;
pub mod session;
pub mod stream;

pub use auth::{
    Anonymous, AuthAcceptor, AuthOutcome, CompatHello, CramMd5, External, Mechanism, SecurityLayer,
};
pub use conn::{BlockHandler, Connection, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE};
pub use editor::{CopySource, DriveOutcome, Editor, WireEditor, replay_drive};
pub use error::{IoOp, RemoteError, RemoteErrorChain, Result, WireError};
pub use item::Item;
pub use session::{
    AcceptOptions, Capability, ConnectOptions, PROTOCOL_VERSION, SessionState, accept, connect,
};
pub use stream::{PipeWireStream, TcpWireStream, WireStream};
