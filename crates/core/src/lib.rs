//! Incremental update engine for keyed columnar tables.
//!
//! The engine ingests batches of row operations keyed by a user-supplied
//! primary key, reconciles them against an authoritative master table,
//! computes per-cell transition metadata, maintains derived columns, and fans
//! the transitional output set out to registered contexts (materialized views
//! built atop the table).
//!
//! The processing pipeline for one batch:
//!
//! 1. [`Engine::send`] accumulates batches on the input port.
//! 2. [`Engine::process_batch`] flattens the batch (one representative row
//!    per key), masks out deletes of absent keys, runs the dtype-specialized
//!    per-column pass producing the delta/prev/current/transitions/existed
//!    tables and the one-row diff table, applies the surviving rows to
//!    master, and notifies every registered [`Context`].
//! 3. [`Pool::process_all`] drives all engines, fires the user-space hook
//!    when any column saw new values, and bumps the pool epoch.

mod column;
mod computed;
mod config;
mod context;
mod engine;
mod error;
mod mask;
mod pool;
mod port;
mod schema;
mod state;
mod table;
mod vocab;

pub use column::Column;
pub use computed::{ComputedColumn, ComputedColumnRegistry, ComputedFunction};
pub use config::EngineConfig;
pub use context::{Context, ContextConfig, ContextHandle, ContextKind, SharedContext, TransitionalSet};
pub use engine::Engine;
pub use error::{EngineError, Result, SchemaError};
pub use mask::Mask;
pub use pool::{Pool, SharedEngine, UpdateTask};
pub use port::{InputPort, OutputPort, OutputPortId};
pub use schema::{Schema, PSP_EXISTED, PSP_INDEX_SENTINEL, PSP_OKEY, PSP_OP, PSP_PKEY};
pub use state::{MasterState, RowLookup};
pub use table::{DataTable, FlattenedBatch};
pub use vocab::Vocab;
