use std::sync::Arc;

use crate::error::Result;
use crate::schema::Schema;
use crate::table::DataTable;

/// Well-known output port indices. Clients retrieve transitional tables by
/// these after `process_batch` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum OutputPortId {
    Flattened = 0,
    Delta = 1,
    Prev = 2,
    Current = 3,
    Transitions = 4,
    Existed = 5,
    Diff = 6,
}

impl OutputPortId {
    pub const ALL: [OutputPortId; 7] = [
        OutputPortId::Flattened,
        OutputPortId::Delta,
        OutputPortId::Prev,
        OutputPortId::Current,
        OutputPortId::Transitions,
        OutputPortId::Existed,
        OutputPortId::Diff,
    ];
}

/// Staging area accumulating submitted row batches into a single flat table
/// until the engine processes them.
///
/// Not safe for concurrent writers on its own; the engine wraps it in a mutex
/// and the intended usage is one writer feeding one engine.
pub struct InputPort {
    schema: Schema,
    table: DataTable,
}

impl InputPort {
    pub fn new(schema: &Schema) -> Self {
        InputPort {
            schema: schema.clone(),
            table: DataTable::new(schema),
        }
    }

    /// Row-append a batch. Fails with `SchemaMismatch` when the batch's
    /// columns do not match the input schema.
    pub fn send(&mut self, batch: &DataTable) -> Result<()> {
        self.table.append(batch)?;
        Ok(())
    }

    pub fn table(&self) -> &DataTable {
        &self.table
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Reset the port to empty after a successful process.
    pub fn release_or_clear(&mut self) {
        self.table = DataTable::new(&self.schema);
    }

    pub(crate) fn promote_column(&mut self, name: &str, new: prism_types::Dtype) -> Result<()> {
        self.schema.retype_column(name, new);
        self.table.promote_column(name, new)
    }
}

/// One published transitional table.
///
/// The table is held behind an `Arc`: contexts and clients may retain the
/// published value past a batch, in which case the engine's next write
/// copy-on-writes instead of mutating it out from under them.
pub struct OutputPort {
    schema: Schema,
    table: Arc<DataTable>,
}

impl OutputPort {
    pub fn new(schema: &Schema) -> Self {
        OutputPort {
            schema: schema.clone(),
            table: Arc::new(DataTable::new(schema)),
        }
    }

    pub fn table(&self) -> &Arc<DataTable> {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut DataTable {
        Arc::make_mut(&mut self.table)
    }

    pub fn set_table(&mut self, table: Arc<DataTable>) {
        self.table = table;
    }

    /// Drop the published contents, replacing them with an empty table of
    /// the port's schema. Retained `Arc`s keep the old contents alive.
    pub fn clear(&mut self) {
        self.table = Arc::new(DataTable::new(&self.schema));
    }

    pub(crate) fn retype_schema(&mut self, name: &str, new: prism_types::Dtype) {
        self.schema.retype_column(name, new);
    }
}
