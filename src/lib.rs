pub mod arbiter;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod explain;
pub mod extractor;
pub mod intent;
pub mod lexicon;
pub mod matcher;
pub mod model;
pub mod sql_compiler;
pub mod validator;

pub use arbiter::{ArbiterState, CandidateQuery, Origin, Translation};
pub use catalog::SchemaCatalog;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
