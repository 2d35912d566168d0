//! Streaming JSON projection.
//!
//! A query such as `{ id, profile { name } }` is compiled into a selection
//! tree, then a single pass over the document bytes builds only the selected
//! fields. Unselected values are skipped without being materialized. Input may
//! arrive in chunks of any size.

pub mod config;
pub mod engine;
pub mod error;
pub mod lexer;
pub mod ndjson;
pub mod pool;
pub mod runtime;
pub mod selection;
pub mod sink;

// Convenient re-exports
pub use engine::{Document, EmitMode, Engine, EngineOptions, Match, RawMatch};
pub use error::{LexError, PoolError, QueryError, QuerySyntaxError, SinkError, StructuralError};
pub use ndjson::{ndjson_parallel, ndjson_stream, LineFramer, Record};
pub use pool::{PoolConfig, WorkRequest, WorkResponse, WorkerPool};
pub use runtime::{query, query_bytes, spawn_subscription, subscribe, subscribe_reader, QueryOptions, QueryOutcome, Subscription};
pub use selection::{compile, Group, Selection};
pub use sink::{CollectSink, FnSink, Sink, Stats};
