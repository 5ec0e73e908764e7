use std::collections::HashMap;

use fixedbitset::FixedBitSet;
use itertools::Itertools as _;
use prism_types::{Dtype, Op, Scalar};

use crate::error::{EngineError, Result};
use crate::mask::Mask;
use crate::schema::{Schema, PSP_OP, PSP_PKEY};
use crate::table::DataTable;

/// Result of a primary-key lookup: the row slot in the master table and
/// whether the key is live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowLookup {
    pub slot: usize,
    pub exists: bool,
}

/// The authoritative, mutable, column-oriented table holding the latest row
/// for every live key, plus the primary-key index over it.
///
/// Deleted slots are marked free and reused for later inserts; they are never
/// observable through the pkeyed views.
pub struct MasterState {
    table: DataTable,
    index: HashMap<Scalar, usize>,
    free: Vec<usize>,
    live: FixedBitSet,
}

impl MasterState {
    pub fn new(input_schema: &Schema) -> Self {
        MasterState {
            table: DataTable::new(input_schema),
            index: HashMap::new(),
            free: Vec::new(),
            live: FixedBitSet::default(),
        }
    }

    pub fn table(&self) -> &DataTable {
        &self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut DataTable {
        &mut self.table
    }

    pub fn lookup(&self, pkey: &Scalar) -> RowLookup {
        match self.index.get(pkey) {
            Some(&slot) => RowLookup { slot, exists: true },
            None => RowLookup {
                slot: 0,
                exists: false,
            },
        }
    }

    pub fn has_pkey(&self, pkey: &Scalar) -> bool {
        self.index.contains_key(pkey)
    }

    /// Number of live keys.
    pub fn mapping_size(&self) -> usize {
        self.index.len()
    }

    /// Live primary keys in slot order.
    pub fn pkeys(&self) -> Vec<Scalar> {
        let pkey_col = self.table.column(PSP_PKEY).expect("master carries psp_pkey");
        self.live.ones().map(|slot| pkey_col.get_scalar(slot)).collect()
    }

    fn alloc_slot(&mut self) -> usize {
        if let Some(slot) = self.free.pop() {
            return slot;
        }
        let slot = self.table.num_rows();
        self.table.set_num_rows(slot + 1);
        slot
    }

    /// Apply one already-reconciled (flattened, masked) batch.
    ///
    /// INSERT on an absent key allocates a slot and writes every cell;
    /// INSERT on a present key overwrites only the cells valid in the batch
    /// (partial update); DELETE frees the slot and removes the key.
    pub fn update_master_table(&mut self, flat: &DataTable) -> Result<()> {
        let rows = flat.num_rows();
        for idx in 0..rows {
            let raw = flat
                .column(PSP_OP)
                .ok_or_else(|| EngineError::NoSuchColumn(PSP_OP.to_string()))?
                .value::<u8>(idx);
            let op = Op::from_u8(raw).ok_or(EngineError::UnknownOp { row: idx, op: raw })?;
            let pkey = flat
                .column(PSP_PKEY)
                .ok_or_else(|| EngineError::NoSuchColumn(PSP_PKEY.to_string()))?
                .get_scalar(idx);
            match op {
                Op::Insert => match self.index.get(&pkey) {
                    Some(&slot) => self.overwrite_valid_cells(flat, idx, slot),
                    None => {
                        let slot = self.alloc_slot();
                        self.write_new_row(flat, idx, slot, &pkey);
                        if slot >= self.live.len() {
                            self.live.grow(slot + 1);
                        }
                        self.live.insert(slot);
                        self.index.insert(pkey, slot);
                    }
                },
                Op::Delete => {
                    if let Some(slot) = self.index.remove(&pkey) {
                        self.live.set(slot, false);
                        self.free.push(slot);
                        for name in self.table.schema().names().map(str::to_owned).collect::<Vec<_>>() {
                            self.table
                                .column_mut(&name)
                                .expect("iterating own schema")
                                .set_valid(slot, false);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn overwrite_valid_cells(&mut self, flat: &DataTable, idx: usize, slot: usize) {
        for (name, _) in flat.schema().iter() {
            if name == PSP_PKEY || name == PSP_OP {
                continue;
            }
            let Some(src) = flat.column(name) else { continue };
            if !src.is_valid(idx) {
                continue;
            }
            if let Some(dst) = self.table.column_mut(name) {
                let value = src.get_scalar(idx);
                dst.set_scalar(slot, &value);
            }
        }
    }

    fn write_new_row(&mut self, flat: &DataTable, idx: usize, slot: usize, pkey: &Scalar) {
        // A reused slot may hold stale cells from the row it used to carry,
        // so every master column gets written or invalidated.
        let names: Vec<String> = self.table.schema().names().map(str::to_owned).collect();
        for name in names {
            let dst = self.table.column_mut(&name).expect("iterating own schema");
            if name == PSP_PKEY {
                dst.set_scalar(slot, pkey);
            } else if name == PSP_OP {
                dst.set_value::<u8>(slot, Op::Insert.as_u8());
                dst.set_valid(slot, true);
            } else {
                match flat.column(&name) {
                    Some(src) => {
                        let value = src.get_scalar(idx);
                        dst.set_scalar(slot, &value);
                    }
                    None => dst.set_valid(slot, false),
                }
            }
        }
    }

    fn live_mask(&self) -> Mask {
        let mut mask = Mask::new(self.table.num_rows());
        for slot in self.live.ones() {
            mask.set(slot, true);
        }
        mask
    }

    /// Read view over the live rows, in slot order.
    pub fn pkeyed_table(&self) -> DataTable {
        self.table.clone_masked(&self.live_mask())
    }

    /// Read view over the live rows, ordered by ascending primary key.
    pub fn sorted_pkeyed_table(&self) -> DataTable {
        let pkey_col = self.table.column(PSP_PKEY).expect("master carries psp_pkey");
        let slots: Vec<usize> = self
            .live
            .ones()
            .sorted_by_key(|&slot| pkey_col.get_scalar(slot))
            .collect();
        self.table.clone_reordered(&slots)
    }

    /// Retype a column; a promoted primary key also rebuilds the index so
    /// the mapping keys stay in the new dtype.
    pub fn promote_column(&mut self, name: &str, new: Dtype) -> Result<()> {
        self.table.promote_column(name, new)?;
        if name == PSP_PKEY {
            let mut index = HashMap::with_capacity(self.index.len());
            for (key, slot) in self.index.drain() {
                let key = key.promote(new).unwrap_or(Scalar::Null);
                index.insert(key, slot);
            }
            self.index = index;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.table.clear();
        self.index.clear();
        self.free.clear();
        self.live.clear();
    }
}
