#![forbid(unsafe_code)]
//! Transport drivers, retry supervision, the server registry, the
//! persistence layer, and the RPC facade: everything between a
//! `ServerSpec` on disk and a live `tools/call` round trip.

pub mod config;
pub mod facade;
pub mod registry;
pub mod retry;
pub mod store;
pub mod transport;

pub use config::RuntimeConfig;
pub use facade::McpFacade;
pub use registry::{HandshakeTimeouts, ServerRegistry};
pub use retry::RetrySupervisor;
pub use store::{SpecStore, SqlSpecStore};
pub use transport::{Driver, SseDriver, StdioDriver, StreamableHttpDriver};
