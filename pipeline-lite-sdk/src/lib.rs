//! pipeline-lite SDK: the module side of distributed execution.
//!
//! A module hosts steps, facilitators and advisers in its own process. The
//! core reaches them through a `ModuleLink`; the module answers through an
//! [`SdkClient`]:
//! - `module` - [`PipelineModule`], the event handler
//! - `client` - one typed method per module → core message
//! - `transport` - an in-process pair of endpoints for embedding and tests

pub mod client;
pub mod module;
pub mod transport;

pub use client::SdkClient;
pub use module::PipelineModule;
pub use transport::{in_process, InProcessTransport};
