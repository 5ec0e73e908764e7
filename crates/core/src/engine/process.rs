use prism_types::{Dtype, Op, Transition};

use crate::column::{Column, Native};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::mask::Mask;
use crate::schema::PSP_EXISTED;
use crate::state::RowLookup;
use crate::table::DataTable;

/// Scratch state threaded through one `process_batch` call, indexed by
/// flattened row.
pub(crate) struct ProcessState {
    pub lookup: Vec<RowLookup>,
    pub ops: Vec<Op>,
    pub added_offset: Vec<usize>,
    pub prev_pkey_eq: Vec<bool>,
}

/// One column's share of the per-column pass: the four transitional columns
/// moved out of their tables so workers never alias, plus the latched notify
/// bit destined for the diff table.
pub(crate) struct ColumnUnit {
    pub name: String,
    pub dtype: Dtype,
    pub delta: Column,
    pub prev: Column,
    pub current: Column,
    pub transitions: Column,
    pub notify: bool,
}

/// Select the transition code for one cell.
///
/// The clauses run in a fixed order and the first match wins; the three
/// `backout_*` switches disable their clause entirely. The re-insert check
/// runs ahead of the equality clauses: a key deleted and re-inserted within
/// one batch still has its previous cells live in master, and without the
/// early check the equality clauses would classify it as a plain update.
pub(crate) fn calc_transition(
    cfg: &EngineConfig,
    prev_existed: bool,
    row_already_exists: bool,
    exists: bool,
    prev_valid: bool,
    cur_valid: bool,
    prev_cur_eq: bool,
    prev_pkey_eq: bool,
) -> Option<Transition> {
    if prev_pkey_eq && prev_existed {
        return Some(Transition::NeqTdt);
    }
    if !row_already_exists && !cur_valid && !cfg.backout_invalid_neq_ft {
        Some(Transition::NeqFt)
    } else if row_already_exists && !prev_valid && !cur_valid && !cfg.backout_eq_invalid_invalid {
        Some(Transition::EqTt)
    } else if !prev_existed && !exists {
        Some(Transition::EqFf)
    } else if row_already_exists && exists && !prev_valid && cur_valid && !cfg.backout_nveq_ft {
        Some(Transition::NveqFt)
    } else if prev_existed && exists && prev_cur_eq {
        Some(Transition::EqTt)
    } else if !prev_existed && exists {
        Some(Transition::NeqFt)
    } else if prev_existed && !exists {
        Some(Transition::NeqTf)
    } else if prev_existed && exists && !prev_cur_eq {
        Some(Transition::NeqTt)
    } else if prev_pkey_eq {
        // Prior op in the batch was a delete.
        Some(Transition::NeqTdt)
    } else {
        None
    }
}

/// Build the survival mask and the `existed` table, and fill
/// `ProcessState::added_offset`.
///
/// Every INSERT survives; a DELETE survives only when its key is live in
/// master. `added_offset[i]` is the prefix count of surviving rows, i.e. the
/// compacted slot row `i` writes to in the transitional tables.
pub(crate) fn mask_existed_rows(
    state: &mut ProcessState,
    flattened: &DataTable,
    existed: &mut DataTable,
) -> Result<Mask> {
    let rows = flattened.num_rows();
    existed.set_num_rows(rows);
    let existed_col = existed
        .column_mut(PSP_EXISTED)
        .ok_or_else(|| EngineError::NoSuchColumn(PSP_EXISTED.to_string()))?;

    state.added_offset.clear();
    state.added_offset.reserve(rows);
    let mut mask = Mask::new(rows);
    let mut added = 0usize;

    for idx in 0..rows {
        let raw_exists = state.lookup[idx].exists;
        state.added_offset.push(added);
        match state.ops[idx] {
            Op::Insert => {
                let row_already_exists = raw_exists && !state.prev_pkey_eq[idx];
                mask.set(idx, true);
                existed_col.set_value::<u8>(added, row_already_exists as u8);
                existed_col.set_valid(added, true);
                added += 1;
            }
            Op::Delete => {
                if raw_exists {
                    mask.set(idx, true);
                    existed_col.set_value::<u8>(added, 1);
                    existed_col.set_valid(added, true);
                    added += 1;
                } else {
                    mask.set(idx, false);
                }
            }
        }
    }

    debug_assert_eq!(mask.count(), added);
    Ok(mask)
}

/// Process one column across all flattened rows, dtype-specialized.
///
/// Booleans ride the `u8` path, dates `u32` and times `i64`.
pub(crate) fn process_column_unit(
    unit: &mut ColumnUnit,
    flattened: &DataTable,
    master: &DataTable,
    state: &ProcessState,
    cfg: &EngineConfig,
) -> Result<()> {
    let flat_col = flattened
        .column(&unit.name)
        .ok_or_else(|| EngineError::NoSuchColumn(unit.name.clone()))?;
    let master_col = master
        .column(&unit.name)
        .ok_or_else(|| EngineError::NoSuchColumn(unit.name.clone()))?;
    if flat_col.dtype() != unit.dtype || master_col.dtype() != unit.dtype {
        return Err(EngineError::UnknownDtype(unit.name.clone()));
    }

    let name = unit.name.clone();
    let (delta, prev, current, transitions) = (
        &mut unit.delta,
        &mut unit.prev,
        &mut unit.current,
        &mut unit.transitions,
    );
    unit.notify = match unit.dtype {
        Dtype::I8 => process_numeric::<i8>(flat_col, master_col, delta, prev, current, transitions, state, cfg, &name)?,
        Dtype::I16 => process_numeric::<i16>(flat_col, master_col, delta, prev, current, transitions, state, cfg, &name)?,
        Dtype::I32 => process_numeric::<i32>(flat_col, master_col, delta, prev, current, transitions, state, cfg, &name)?,
        Dtype::I64 | Dtype::Time => process_numeric::<i64>(flat_col, master_col, delta, prev, current, transitions, state, cfg, &name)?,
        Dtype::U8 | Dtype::Bool => process_numeric::<u8>(flat_col, master_col, delta, prev, current, transitions, state, cfg, &name)?,
        Dtype::U16 => process_numeric::<u16>(flat_col, master_col, delta, prev, current, transitions, state, cfg, &name)?,
        Dtype::U32 | Dtype::Date => process_numeric::<u32>(flat_col, master_col, delta, prev, current, transitions, state, cfg, &name)?,
        Dtype::U64 => process_numeric::<u64>(flat_col, master_col, delta, prev, current, transitions, state, cfg, &name)?,
        Dtype::F32 => process_numeric::<f32>(flat_col, master_col, delta, prev, current, transitions, state, cfg, &name)?,
        Dtype::F64 => process_numeric::<f64>(flat_col, master_col, delta, prev, current, transitions, state, cfg, &name)?,
        Dtype::Str => process_string(flat_col, master_col, delta, prev, current, transitions, state, cfg, &name)?,
    };
    Ok(())
}

/// The numeric (and numeric-backed) per-cell routine.
///
/// For surviving inserts: `prev` mirrors the master cell, `current` carries
/// the batch value falling back to the previous one on a partial update, and
/// `delta` is `current - previous` with two's-complement wraparound, zero when
/// the incoming cell is invalid. A surviving delete republishes the previous
/// value in both `prev` and `current`, negates it into `delta` and always
/// latches the notify bit.
#[allow(clippy::too_many_arguments)]
fn process_numeric<T: Native>(
    flattened: &Column,
    master: &Column,
    delta: &mut Column,
    prev: &mut Column,
    current: &mut Column,
    transitions: &mut Column,
    state: &ProcessState,
    cfg: &EngineConfig,
    name: &str,
) -> Result<bool> {
    let mut notify = false;
    for idx in 0..flattened.len() {
        let k = state.added_offset[idx];
        let rlookup = state.lookup[idx];
        let prev_pkey_eq = state.prev_pkey_eq[idx];
        match state.ops[idx] {
            Op::Insert => {
                let in_master = rlookup.exists;
                let row_already_exists = in_master && !prev_pkey_eq;
                let (prev_value, prev_valid) = if in_master {
                    (master.value::<T>(rlookup.slot), master.is_valid(rlookup.slot))
                } else {
                    (T::default(), false)
                };
                let current_value = flattened.value::<T>(idx);
                let cur_valid = flattened.is_valid(idx);
                let exists = cur_valid || prev_valid;
                let prev_existed = in_master && prev_valid;
                // A cell the batch leaves invalid keeps its previous value,
                // so it counts as unchanged for the notification gate.
                let prev_cur_eq = if cur_valid {
                    prev_valid && prev_value == current_value
                } else {
                    true
                };
                if !prev_cur_eq {
                    notify = true;
                }
                let trans = calc_transition(
                    cfg,
                    prev_existed,
                    row_already_exists,
                    exists,
                    prev_valid,
                    cur_valid,
                    prev_cur_eq,
                    prev_pkey_eq,
                )
                .ok_or_else(|| EngineError::UnexpectedTransition {
                    row: idx,
                    column: name.to_string(),
                })?;

                delta.set_value::<T>(
                    k,
                    if cur_valid {
                        current_value.wrapping_sub(prev_value)
                    } else {
                        T::default()
                    },
                );
                delta.set_valid(k, true);

                prev.set_value::<T>(k, prev_value);
                prev.set_valid(k, prev_valid);

                current.set_value::<T>(k, if cur_valid { current_value } else { prev_value });
                current.set_valid(k, exists);

                transitions.set_value::<u8>(k, trans.as_u8());
                transitions.set_valid(k, true);
            }
            Op::Delete => {
                if rlookup.exists {
                    let prev_value = master.value::<T>(rlookup.slot);
                    let prev_valid = master.is_valid(rlookup.slot);

                    prev.set_value::<T>(k, prev_value);
                    prev.set_valid(k, prev_valid);

                    current.set_value::<T>(k, prev_value);
                    current.set_valid(k, prev_valid);

                    delta.set_value::<T>(k, prev_value.wrapping_neg());
                    delta.set_valid(k, true);

                    transitions.set_value::<u8>(k, Transition::NeqTdf.as_u8());
                    transitions.set_valid(k, true);

                    // Removing a live row is always a material change.
                    notify = true;
                }
            }
        }
    }
    Ok(notify)
}

/// The string specialization.
///
/// `prev` borrows the master column's vocabulary for the batch, so previous
/// values are written as raw dictionary ids. Equality is byte-wise (id-wise
/// when a vocabulary is shared); empty strings always compare equal. The
/// delta column carries the "newer" value: current when valid, else previous.
#[allow(clippy::too_many_arguments)]
fn process_string(
    flattened: &Column,
    master: &Column,
    delta: &mut Column,
    prev: &mut Column,
    current: &mut Column,
    transitions: &mut Column,
    state: &ProcessState,
    cfg: &EngineConfig,
    name: &str,
) -> Result<bool> {
    prev.borrow_vocabulary(master);

    let mut notify = false;
    for idx in 0..flattened.len() {
        let k = state.added_offset[idx];
        let rlookup = state.lookup[idx];
        let prev_pkey_eq = state.prev_pkey_eq[idx];
        match state.ops[idx] {
            Op::Insert => {
                let in_master = rlookup.exists;
                let row_already_exists = in_master && !prev_pkey_eq;
                let prev_valid = in_master && master.is_valid(rlookup.slot);
                let cur_valid = flattened.is_valid(idx);
                let exists = cur_valid || prev_valid;
                let prev_existed = in_master && prev_valid;
                let prev_cur_eq = if cur_valid {
                    prev_valid && flattened.strings_equal(idx, master, rlookup.slot)
                } else {
                    true
                };
                if !prev_cur_eq {
                    notify = true;
                }
                let trans = calc_transition(
                    cfg,
                    prev_existed,
                    row_already_exists,
                    exists,
                    prev_valid,
                    cur_valid,
                    prev_cur_eq,
                    prev_pkey_eq,
                )
                .ok_or_else(|| EngineError::UnexpectedTransition {
                    row: idx,
                    column: name.to_string(),
                })?;

                if prev_valid {
                    prev.set_str_id(k, master.str_id(rlookup.slot));
                }
                prev.set_valid(k, prev_valid);

                if cur_valid {
                    current.set_str(k, flattened.str_at(idx));
                    delta.set_str(k, flattened.str_at(idx));
                } else if prev_valid {
                    current.set_str(k, master.str_at(rlookup.slot));
                    delta.set_str(k, master.str_at(rlookup.slot));
                }
                current.set_valid(k, exists);
                delta.set_valid(k, exists);

                transitions.set_value::<u8>(k, trans.as_u8());
                transitions.set_valid(k, true);
            }
            Op::Delete => {
                if rlookup.exists {
                    let prev_valid = master.is_valid(rlookup.slot);
                    if prev_valid {
                        prev.set_str_id(k, master.str_id(rlookup.slot));
                        current.set_str(k, master.str_at(rlookup.slot));
                        delta.set_str(k, master.str_at(rlookup.slot));
                    }
                    prev.set_valid(k, prev_valid);
                    current.set_valid(k, prev_valid);
                    delta.set_valid(k, prev_valid);

                    transitions.set_value::<u8>(k, Transition::NeqTdf.as_u8());
                    transitions.set_valid(k, true);

                    notify = true;
                }
            }
        }
    }
    Ok(notify)
}

#[cfg(test)]
mod test {
    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn transition_table_base_cases() {
        let c = cfg();
        // New row, valid cell.
        assert_eq!(
            calc_transition(&c, false, false, true, false, true, false, false),
            Some(Transition::NeqFt)
        );
        // New row, invalid cell (clause 1).
        assert_eq!(
            calc_transition(&c, false, false, false, false, false, true, false),
            Some(Transition::NeqFt)
        );
        // Existing row, both sides invalid (clause 2).
        assert_eq!(
            calc_transition(&c, false, true, false, false, false, true, false),
            Some(Transition::EqTt)
        );
        // Existing row, invalid cell became valid (clause 4).
        assert_eq!(
            calc_transition(&c, false, true, true, false, true, false, false),
            Some(Transition::NveqFt)
        );
        // Existing valid cell, equal value.
        assert_eq!(
            calc_transition(&c, true, true, true, true, true, true, false),
            Some(Transition::EqTt)
        );
        // Existing valid cell, changed value.
        assert_eq!(
            calc_transition(&c, true, true, true, true, true, false, false),
            Some(Transition::NeqTt)
        );
    }

    #[test]
    fn reinsert_branch_wins_over_equality() {
        let c = cfg();
        // Key deleted and re-inserted in one batch while its master row is
        // still live: NEQ_TDT even when the values are equal.
        assert_eq!(
            calc_transition(&c, true, false, true, true, true, true, true),
            Some(Transition::NeqTdt)
        );
        // Same shape but the key never lived in master: a plain appearance.
        assert_eq!(
            calc_transition(&c, false, false, true, false, true, false, true),
            Some(Transition::NeqFt)
        );
    }

    #[test]
    fn backout_flags_suppress_their_clause() {
        let mut c = cfg();
        c.backout_invalid_neq_ft = true;
        // Clause 1 disabled: a new row's invalid cell falls through to EQ_FF.
        assert_eq!(
            calc_transition(&c, false, false, false, false, false, true, false),
            Some(Transition::EqFf)
        );
        let mut c = cfg();
        c.backout_eq_invalid_invalid = true;
        assert_eq!(
            calc_transition(&c, false, true, false, false, false, true, false),
            Some(Transition::EqFf)
        );
        let mut c = cfg();
        c.backout_nveq_ft = true;
        assert_eq!(
            calc_transition(&c, false, true, true, false, true, false, false),
            Some(Transition::NeqFt)
        );
    }
}
