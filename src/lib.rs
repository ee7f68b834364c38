//! # schematron
//!
//! An ISO Schematron validation engine. Schemas are read from XML, compiled
//! into a flat executable form with abstract patterns and rule inheritance
//! resolved, and run against instance documents through an XPath 1.0
//! evaluator. Schemas written for XPath 2.0 based bindings are supported
//! through a rewriter for the commonly used subset of the language.

pub mod cache;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod expr;
pub mod file_discovery;
pub mod http_client;
pub mod output;
pub mod parser;
pub mod query;
pub mod schema;
pub mod schema_loader;
pub mod validator;

pub use cache::{CacheConfig, CacheStats, CachedSchema, SchemaCache};
pub use cli::{Cli, OutputFormat, VerbosityLevel};
pub use compiler::{ActivePhase, CompiledSchema, compile};
pub use config::{Config, ConfigManager};
pub use engine::{
    EngineConfig, FileValidationResult, ProgressCallback, ValidationEngine, ValidationProgress,
    ValidationResults, ValidationStatus,
};
pub use error::{EvaluationError, ParseError, SchemaError, ScopeError, ValidationError};
pub use expr::{Rewrite, rewrite};
pub use file_discovery::FileDiscovery;
pub use http_client::{AsyncHttpClient, HttpClientConfig};
pub use output::Output;
pub use parser::parse_schema;
pub use query::{MatchContext, QueryLanguage};
pub use schema::SchematronDocument;
pub use schema_loader::{SchemaLoader, SchemaReference, SchemaSource};
pub use validator::{ValidationEvent, ValidationOptions, ValidationReport, Validator};

/// Parse and compile schema text in one step.
pub fn compile_schema(text: &str) -> error::SchemaResult<CompiledSchema> {
    compile(&parse_schema(text)?)
}
