//! bitmessaged - Bitmessage protocol engine daemon
//!
//! Ties together the wire-level gossip in `bitmessage-net` and the
//! cryptographic object model in `bitmessage-core` into a node that holds
//! identities, tracks contacts and subscriptions, and drives the
//! send/receive pipeline (spec.md §1, §2).
//!
//! # Modules
//!
//! - [`config`]: CLI/config surface ([`config::Config`]).
//! - [`ports`]: identity/contact/subscription and message repositories.
//! - [`pipeline`]: outbound send flow and inbound object dispatch.
//! - [`server`]: the TCP accept loop tying connections to the pipeline.

pub mod config;
pub mod pipeline;
pub mod ports;
pub mod server;

pub use config::Config;
pub use pipeline::{Pipeline, PipelineError};
pub use server::{Server, ServerError};
