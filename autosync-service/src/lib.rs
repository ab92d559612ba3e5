//! AutoSync service host: one controller per configured agent over a shared
//! lock registry and notification bus.

mod error;
mod runtime;

pub use error::ServiceError;
pub use runtime::{
    init_tracing, run, start_blocking, AutoSyncService, EngineProvider, ServiceBuilder,
};
