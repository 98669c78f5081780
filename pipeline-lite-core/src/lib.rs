//! pipeline-lite core: a resumable plan execution engine.
//!
//! A plan is a graph of nodes. Each node is facilitated into an execution
//! mode, invoked through its step, concluded with a response, and advised
//! into its successor. Everything in between is persisted status plus a
//! callback parked in the wait/notify engine, so any node can be resumed by
//! whoever delivers the response it waits on:
//! - `engine` - the facilitation → invocation → response → advice loop
//! - `store` / `store_memory` - persisted plan and node executions, outcomes, events
//! - `waiter` - wait-for-all correlation ids, delays and timeouts
//! - `interrupt` - pause, resume, abort and retry signals
//! - `protocol` / `remote` / `dispatcher` - steps hosted by out-of-process modules

pub mod adviser;
pub mod ambiance;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod expression;
pub mod facilitator;
pub mod interrupt;
pub mod invoker;
pub mod plan;
pub mod protocol;
pub mod registry;
pub mod remote;
pub mod resolver;
pub mod step;
pub mod store;
pub mod store_memory;
pub mod task;
pub mod types;
pub mod waiter;

pub use config::EngineConfig;
pub use dispatcher::SdkRequestDispatcher;
pub use engine::ExecutionEngine;
pub use error::EngineError;
pub use registry::Registries;
pub use store::ExecutionStore;
pub use store_memory::MemoryStore;
