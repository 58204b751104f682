//! Agent relay core: session orchestration, sandboxed tool execution, and
//! resumable per-session event streams.

pub mod bus;
pub mod cli;
pub mod config;
pub mod events;
pub mod planner;
pub mod provider;
pub mod registry;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod tools;
