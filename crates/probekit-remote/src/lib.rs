//! Probekit Remote
//!
//! Runs a test container's runtime in a spawned `probekit-host` process and
//! drives it over a small framed RPC, with a side-channel listener for
//! asynchronous test outcomes.

pub mod client;
pub mod diagnostics;
pub mod env;
pub mod error;
pub mod forked;
pub mod listener;
pub mod protocol;
pub mod server;

pub use client::RemoteFramework;
pub use env::prepare_environment;
pub use error::{RemoteError, RemoteResult};
pub use forked::{choose_invoker_port, ForkedTestContainer, ForkedTestContainerFactory};
pub use listener::TestListenerTask;
pub use server::FrameworkServer;
