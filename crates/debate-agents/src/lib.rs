//! Agents binary support: configuration, the OpenAI-compatible model client,
//! the model-backed judge, the instance lock and the long-running loop.

pub mod config;
pub mod judge;
pub mod llm;
pub mod lock;
pub mod runner;
