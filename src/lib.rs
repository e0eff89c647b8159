//! Asynchronous SMTP/LMTP server core.
//!
//! `dispatcher::run_connection` is the entry point a binary wires a bound
//! `TcpListener` into; everything else (line framing, address/parameter
//! parsing, AUTH, STARTTLS, the PROXY-protocol preamble, the handler hook
//! bus) is assembled underneath it.

pub mod address;
pub mod auth;
pub mod config;
pub mod demo_handler;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod line;
pub mod lookup;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod relay;
pub mod session;
pub mod tls;

pub use config::Config;
pub use dispatcher::{run_connection, Protocol, ServerContext};
pub use error::SessionError;
pub use handler::Handler;
pub use session::{Envelope, Session};
