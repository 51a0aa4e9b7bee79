//! resource-host: an embeddable resource dispatch pipeline
//!
//! The crate mediates every resource load between untrusted logical
//! clients and a pluggable transport layer. One [`ResourceDispatcher`]
//! runs on the IO context, owning a registry of in-flight requests; each
//! request carries a chain of [`handler::ResourceHandler`] decorators that
//! shape, hold or divert its events before they reach the Client context
//! as [`ipc::ClientMessage`]s.
//!
//! What the pipeline takes care of:
//! - security policy and upload vetting before a transport is created
//! - per-request pause votes plus automatic backpressure on unacked data
//! - MIME sniffing and page-load vs download routing
//! - cross-site navigation handoffs and blocked-view request queues
//! - auth and certificate-error holds answered from the Client context
//! - coalesced load-state and throttled upload-progress reporting
//!
//! The embedder supplies a [`transport::TransportFactory`] plus optional
//! policy collaborators, pumps transport events into the dispatcher's
//! `on_transport_*` entry points, and drives the periodic maintenance
//! pass (or spawns [`dispatch::run_tick_loop`] on a tokio runtime).

pub mod dispatch;
pub mod handler;
pub mod ipc;
pub mod policy;
pub mod transport;
pub mod utils;

pub use dispatch::request::{GlobalRequestId, LoadFlags, RequestDescriptor, ResourceKind};
pub use dispatch::{DispatchHandle, DispatcherObserver, ResourceDispatcher, run_tick_loop};
pub use ipc::{ClientMessage, ClientSender};
pub use utils::{CompletionStatus, DispatchError, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
