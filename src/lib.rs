//! Natural-language analytics core: turn a question into a vetted SQL
//! statement, execute it under guardrails against one of the supported
//! backends, and repair it when the backend or the data disagrees.

pub mod backend;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod guard;
pub mod llm;
pub mod normalize;
pub mod pipeline;
pub mod rectify;
pub mod result;
pub mod schema;
pub mod tags;

pub use error::{PilotError, Result};
