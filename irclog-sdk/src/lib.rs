//! IRC logging SDK
//!
//! A small, single-threaded IRC protocol engine. It handles framing,
//! decoding and keepalive, and reconnects with server and nickname failover.
//!
//! # Modules
//!
//! - [`transport`]: buffered TCP/TLS byte transport
//! - [`connection`]: line framing and decoding on top of a transport
//! - [`irc`]: IRC message parsing
//! - [`event`]: ordered, short-circuiting event handlers
//! - [`timer`]: one-shot deferred callbacks
//! - [`session`]: the protocol state machine (registration, PING, keepalive)
//! - [`channel`]: join tracking
//! - [`client`]: failover client and the observer interface
//! - [`log`]: protocol loggers

pub mod channel;
pub mod client;
pub mod connection;
pub mod error;
pub mod event;
pub mod irc;
pub mod log;
pub mod session;
pub mod timer;
pub mod transport;

pub use channel::Channel;
pub use client::{ChannelSpec, Client, ClientConfig, Observer, ServerEndpoint, Subscription};
pub use error::{DecodeError, Error, Result};
pub use event::{Event, EventKind, Flow};
pub use irc::Message;
pub use session::{Session, SessionSettings, SessionState};
pub use transport::TlsMode;
