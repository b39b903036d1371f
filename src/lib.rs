//! chatrelay is a streaming chat relay for OpenAI-compatible providers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`server`] exposes the relay endpoint: multipart requests in, the
//!   provider's event stream out, byte for byte.
//! - [`core`] owns request normalization, the upstream connection, frame
//!   reassembly, deduplication and retry, the result cache, and the client
//!   that consumes a relay.
//! - [`api`] defines the wire payloads shared by both sides.
//! - [`cli`] parses arguments and dispatches to the server or the client.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod server;
pub mod utils;
