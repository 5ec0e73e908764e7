use indexmap::map::Entry;
use indexmap::IndexMap;
use prism_types::{Dtype, Op, Scalar};

use crate::column::Column;
use crate::error::{EngineError, Result, SchemaError};
use crate::mask::Mask;
use crate::schema::{Schema, PSP_OP, PSP_PKEY};

/// A batch collapsed to one representative row per key.
///
/// `reinserted[i]` is true when the representative row is an INSERT that was
/// preceded by a DELETE of the same key inside the batch; the transition
/// calculator uses it to pick the re-insert transition code.
#[derive(Debug, Clone)]
pub struct FlattenedBatch {
    pub table: DataTable,
    pub reinserted: Vec<bool>,
}

/// A named collection of equally sized columns matching a [`Schema`].
#[derive(Debug, Clone, PartialEq)]
pub struct DataTable {
    schema: Schema,
    columns: Vec<Column>,
}

impl DataTable {
    pub fn new(schema: &Schema) -> Self {
        let columns = schema.iter().map(|(_, dtype)| Column::new(dtype)).collect();
        DataTable {
            schema: schema.clone(),
            columns,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.len())
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.schema.position(name).map(|idx| &self.columns[idx])
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.schema
            .position(name)
            .map(move |idx| &mut self.columns[idx])
    }

    pub fn column_at(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    /// Add an all-invalid stub column sized to the current row count. Adding
    /// an existing column with the same dtype is a no-op; a different dtype
    /// replaces the column.
    pub fn add_column(&mut self, name: &str, dtype: Dtype) {
        if let Some(col) = self.column(name) {
            if col.dtype() == dtype {
                return;
            }
        }
        let mut col = Column::new(dtype);
        col.set_len(self.num_rows());
        self.insert_column(name, col);
    }

    /// Insert or replace a column wholesale, keeping the schema in step.
    pub fn insert_column(&mut self, name: &str, mut col: Column) {
        col.set_len(self.num_rows());
        match self.schema.position(name) {
            Some(idx) => {
                self.schema.retype_column(name, col.dtype());
                self.columns[idx] = col;
            }
            None => {
                self.schema.add_column(name, col.dtype());
                self.columns.push(col);
            }
        }
    }

    pub fn remove_column(&mut self, name: &str) -> bool {
        match self.schema.position(name) {
            Some(idx) => {
                self.columns.remove(idx);
                self.schema.remove_column(name);
                true
            }
            None => false,
        }
    }

    /// Move a column out for independent processing; pair with
    /// [`DataTable::restore_column`].
    pub(crate) fn take_column(&mut self, name: &str) -> Option<Column> {
        let idx = self.schema.position(name)?;
        let placeholder = Column::new(self.columns[idx].dtype());
        Some(std::mem::replace(&mut self.columns[idx], placeholder))
    }

    pub(crate) fn restore_column(&mut self, name: &str, col: Column) {
        let idx = self
            .schema
            .position(name)
            .expect("restoring a column that was never taken");
        self.columns[idx] = col;
    }

    pub fn reserve(&mut self, additional: usize) {
        for col in &mut self.columns {
            col.reserve(additional);
        }
    }

    pub fn set_num_rows(&mut self, rows: usize) {
        for col in &mut self.columns {
            col.set_len(rows);
        }
    }

    pub fn clear(&mut self) {
        for col in &mut self.columns {
            col.clear();
        }
    }

    /// Row-append `other`, which must match this table's schema.
    pub fn append(&mut self, other: &DataTable) -> Result<(), SchemaError> {
        self.schema.check_matches(other.schema())?;
        for (name, _) in other.schema.iter() {
            let src = other.column(name).expect("schema checked");
            let idx = self.schema.position(name).expect("schema checked");
            self.columns[idx].append_from(src);
        }
        Ok(())
    }

    pub fn clone_masked(&self, mask: &Mask) -> DataTable {
        DataTable {
            schema: self.schema.clone(),
            columns: self.columns.iter().map(|c| c.clone_masked(mask)).collect(),
        }
    }

    pub fn clone_reordered(&self, order: &[usize]) -> DataTable {
        DataTable {
            schema: self.schema.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| c.clone_reordered(order))
                .collect(),
        }
    }

    /// Retype a column along the promotion lattice, converting its data.
    pub fn promote_column(&mut self, name: &str, new: Dtype) -> Result<()> {
        let idx = self
            .schema
            .position(name)
            .ok_or_else(|| EngineError::NoSuchColumn(name.to_string()))?;
        let from = self.columns[idx].dtype();
        if !from.can_promote_to(new) {
            return Err(EngineError::UnsupportedPromotion {
                column: name.to_string(),
                from,
                to: new,
            });
        }
        self.columns[idx] = self.columns[idx].promote(new);
        self.schema.retype_column(name, new);
        Ok(())
    }

    /// Structural invariants: schema and columns line up, every column has
    /// the same length.
    pub fn verify(&self) -> Result<()> {
        if self.schema.len() != self.columns.len() {
            return Err(EngineError::Verify(format!(
                "schema has {} columns, table has {}",
                self.schema.len(),
                self.columns.len()
            )));
        }
        let rows = self.num_rows();
        for (idx, col) in self.columns.iter().enumerate() {
            let (name, dtype) = self.schema.column_at(idx);
            if col.dtype() != dtype {
                return Err(EngineError::Verify(format!(
                    "column `{name}` stores {} but the schema says {dtype}",
                    col.dtype()
                )));
            }
            if col.len() != rows {
                return Err(EngineError::Verify(format!(
                    "column `{name}` has {} rows, expected {rows}",
                    col.len()
                )));
            }
        }
        Ok(())
    }

    /// Collapse intra-batch multi-ops per key into one representative row.
    ///
    /// Submission order is preserved as order of first key appearance and the
    /// last operation per key wins. Cells invalid in a later INSERT inherit
    /// the most recent earlier valid value for the key; a DELETE resets the
    /// accumulation, so values never coalesce across it. A key whose final
    /// INSERT follows a DELETE in the same batch is flagged in
    /// [`FlattenedBatch::reinserted`].
    pub fn flatten(&self) -> Result<FlattenedBatch> {
        struct Acc {
            op: Op,
            rows: Vec<usize>,
            reinserted: bool,
        }

        let pkey_col = self
            .column(PSP_PKEY)
            .ok_or_else(|| SchemaError::MissingColumn(PSP_PKEY.to_string()))
            .map_err(EngineError::from)?;
        let op_col = self
            .column(PSP_OP)
            .ok_or_else(|| SchemaError::MissingColumn(PSP_OP.to_string()))
            .map_err(EngineError::from)?;

        let mut keys: IndexMap<Scalar, Acc> = IndexMap::new();
        for idx in 0..self.num_rows() {
            let raw = op_col.value::<u8>(idx);
            let op = Op::from_u8(raw).ok_or(EngineError::UnknownOp { row: idx, op: raw })?;
            match keys.entry(pkey_col.get_scalar(idx)) {
                Entry::Occupied(mut entry) => {
                    let acc = entry.get_mut();
                    match op {
                        Op::Insert => {
                            if acc.op == Op::Delete {
                                acc.rows.clear();
                                acc.reinserted = true;
                            }
                            acc.op = Op::Insert;
                            acc.rows.push(idx);
                        }
                        Op::Delete => {
                            acc.op = Op::Delete;
                            acc.rows.clear();
                            acc.reinserted = false;
                        }
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(Acc {
                        op,
                        rows: match op {
                            Op::Insert => vec![idx],
                            Op::Delete => Vec::new(),
                        },
                        reinserted: false,
                    });
                }
            }
        }

        let mut table = DataTable::new(&self.schema);
        table.set_num_rows(keys.len());
        let mut reinserted = Vec::with_capacity(keys.len());
        for (row, (key, acc)) in keys.iter().enumerate() {
            table
                .column_mut(PSP_PKEY)
                .expect("schema carries psp_pkey")
                .set_scalar(row, key);
            let op_out = table.column_mut(PSP_OP).expect("schema carries psp_op");
            op_out.set_value::<u8>(row, acc.op.as_u8());
            op_out.set_valid(row, true);

            if acc.op == Op::Insert {
                for (name, _) in self.schema.iter() {
                    if name == PSP_PKEY || name == PSP_OP {
                        continue;
                    }
                    let src = self.column(name).expect("iterating own schema");
                    if let Some(&src_idx) = acc.rows.iter().rev().find(|&&r| src.is_valid(r)) {
                        let value = src.get_scalar(src_idx);
                        table
                            .column_mut(name)
                            .expect("same schema")
                            .set_scalar(row, &value);
                    }
                }
            }
            reinserted.push(acc.op == Op::Insert && acc.reinserted);
        }

        Ok(FlattenedBatch { table, reinserted })
    }
}
