use std::sync::Arc;

use parking_lot::Mutex;

use crate::computed::ComputedColumn;
use crate::table::DataTable;

/// The shape of view a context maintains over the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    ZeroSided,
    OneSided,
    TwoSided,
    GroupedByKey,
}

/// Per-context configuration the engine needs: the derived columns the
/// context expects to find on every table it is notified with.
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    pub computed_columns: Vec<ComputedColumn>,
}

/// The transitional output set handed to contexts on every processed batch.
///
/// All tables are borrowed for the duration of the notification only; a
/// context wanting to keep data must copy it out.
#[derive(Clone, Copy)]
pub struct TransitionalSet<'a> {
    pub flattened: &'a DataTable,
    pub delta: &'a DataTable,
    pub prev: &'a DataTable,
    pub current: &'a DataTable,
    pub transitions: &'a DataTable,
    pub existed: &'a DataTable,
}

/// Capability set of a materialized view living atop the engine.
///
/// The engine drives each context through `step_begin` → `notify` →
/// `step_end`, strictly in that order and never concurrently for one
/// context. `notify_initial` is the keyed-flattened form used when a context
/// is registered against a non-empty engine and on the first-load path.
pub trait Context: Send {
    fn kind(&self) -> ContextKind;

    fn config(&self) -> &ContextConfig;

    /// Drop all derived state; the next notification rebuilds from scratch.
    fn reset(&mut self);

    fn step_begin(&mut self) {}

    fn step_end(&mut self) {}

    fn notify_initial(&mut self, flattened: &DataTable);

    fn notify(&mut self, set: &TransitionalSet<'_>);

    /// Whether the context accumulated deltas since its last consumer read.
    fn has_deltas(&self) -> bool {
        false
    }
}

pub type SharedContext = Arc<Mutex<dyn Context>>;

/// A registered context: the name is unique per engine, the context itself is
/// owned by the caller and only borrowed through the handle.
#[derive(Clone)]
pub struct ContextHandle {
    pub name: String,
    pub kind: ContextKind,
    pub ctx: SharedContext,
}

impl ContextHandle {
    pub fn new(name: impl Into<String>, ctx: SharedContext) -> Self {
        let kind = ctx.lock().kind();
        ContextHandle {
            name: name.into(),
            kind,
            ctx,
        }
    }
}
