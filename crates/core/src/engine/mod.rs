mod process;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use prism_types::{Dtype, Op, Scalar};
use rayon::prelude::*;

use crate::computed::{compute_column, recompute_column, ComputedColumn, ComputedColumnRegistry};
use crate::config::EngineConfig;
use crate::context::{ContextHandle, SharedContext, TransitionalSet};
use crate::error::{EngineError, Result};
use crate::port::{InputPort, OutputPort, OutputPortId};
use crate::schema::{Schema, PSP_EXISTED, PSP_OP, PSP_PKEY};
use crate::state::{MasterState, RowLookup};
use crate::table::{DataTable, FlattenedBatch};

use process::{mask_existed_rows, process_column_unit, ColumnUnit, ProcessState};

const TRANSITIONAL_PORTS: [OutputPortId; 5] = [
    OutputPortId::Delta,
    OutputPortId::Prev,
    OutputPortId::Current,
    OutputPortId::Transitions,
    OutputPortId::Existed,
];

/// Everything that only exists after `init`.
struct EngineState {
    master: MasterState,
    iport: Mutex<InputPort>,
    oports: Vec<OutputPort>,
    contexts: BTreeMap<String, ContextHandle>,
    computed: ComputedColumnRegistry,
    was_updated: bool,
}

impl EngineState {
    fn oport(&self, id: OutputPortId) -> &OutputPort {
        &self.oports[id as usize]
    }

    fn oport_mut(&mut self, id: OutputPortId) -> &mut OutputPort {
        &mut self.oports[id as usize]
    }
}

/// The incremental update engine over one keyed columnar table.
///
/// An engine owns the master state, the primary-key index, the input port and
/// the seven transitional output ports. Contexts are registered against it by
/// name and notified with the transitional output set on every processed
/// batch. All public operations other than construction fail with
/// [`EngineError::EngineNotInitialized`] until [`Engine::init`] is called.
pub struct Engine {
    id: usize,
    config: EngineConfig,
    input_schema: Schema,
    output_schema: Schema,
    transitional_schemas: Vec<Schema>,
    state: Option<EngineState>,
}

impl Engine {
    /// Create an engine from its two schemas. `input_schema` carries the
    /// reserved `psp_pkey` and `psp_op` columns in addition to every column
    /// of `output_schema`.
    pub fn new(input_schema: Schema, output_schema: Schema, config: EngineConfig) -> Self {
        // Each transitions cell holds a transition code; each diff cell one
        // boolean saying whether the column saw new values this batch.
        let trans_schema = Schema::new(
            output_schema
                .names()
                .map(|n| (n.to_string(), Dtype::U8))
                .collect::<Vec<_>>(),
        );
        let diff_schema = Schema::new(
            output_schema
                .names()
                .map(|n| (n.to_string(), Dtype::Bool))
                .collect::<Vec<_>>(),
        );
        let existed_schema = Schema::new([(PSP_EXISTED.to_string(), Dtype::Bool)]);

        let transitional_schemas = vec![
            input_schema.clone(),   // flattened
            output_schema.clone(),  // delta
            output_schema.clone(),  // prev
            output_schema.clone(),  // current
            trans_schema,           // transitions
            existed_schema,         // existed
            diff_schema,            // diff
        ];

        Engine {
            id: 0,
            config,
            input_schema,
            output_schema,
            transitional_schemas,
            state: None,
        }
    }

    /// Build the master state and the ports. Idempotent.
    pub fn init(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }
        let oports = self
            .transitional_schemas
            .iter()
            .map(OutputPort::new)
            .collect();
        self.state = Some(EngineState {
            master: MasterState::new(&self.input_schema),
            iport: Mutex::new(InputPort::new(&self.input_schema)),
            oports,
            contexts: BTreeMap::new(),
            computed: ComputedColumnRegistry::default(),
            was_updated: false,
        });
        Ok(())
    }

    fn state(&self) -> Result<&EngineState> {
        self.state.as_ref().ok_or(EngineError::EngineNotInitialized)
    }

    fn state_mut(&mut self) -> Result<&mut EngineState> {
        self.state.as_mut().ok_or(EngineError::EngineNotInitialized)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn set_id(&mut self, id: usize) {
        self.id = id;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    pub fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    /// Queue a batch on the input port. The batch must match the input
    /// schema; accumulation is row-append until the next `process_batch`.
    pub fn send(&self, batch: &DataTable) -> Result<()> {
        self.state()?.iport.lock().send(batch)
    }

    /// Number of live keys in the master state.
    pub fn mapping_size(&self) -> Result<usize> {
        Ok(self.state()?.master.mapping_size())
    }

    pub fn has_pkey(&self, pkey: &Scalar) -> Result<bool> {
        Ok(self.state()?.master.has_pkey(pkey))
    }

    pub fn pkeys(&self) -> Result<Vec<Scalar>> {
        Ok(self.state()?.master.pkeys())
    }

    /// The raw master table, including freed slots.
    pub fn table(&self) -> Result<&DataTable> {
        Ok(self.state()?.master.table())
    }

    /// The live master rows, in slot order.
    pub fn pkeyed_table(&self) -> Result<DataTable> {
        Ok(self.state()?.master.pkeyed_table())
    }

    /// The live master rows, ordered by ascending primary key.
    pub fn sorted_pkeyed_table(&self) -> Result<DataTable> {
        Ok(self.state()?.master.sorted_pkeyed_table())
    }

    /// The table currently published on `port`.
    pub fn output_table(&self, port: OutputPortId) -> Result<Arc<DataTable>> {
        Ok(Arc::clone(self.state()?.oport(port).table()))
    }

    /// Whether the last `process_batch` found work to do.
    pub fn was_updated(&self) -> bool {
        self.state.as_ref().map_or(false, |st| st.was_updated)
    }

    pub fn clear_updated(&mut self) {
        if let Some(st) = self.state.as_mut() {
            st.was_updated = false;
        }
    }

    pub fn release_inputs(&mut self) -> Result<()> {
        self.state_mut()?.iport.lock().release_or_clear();
        Ok(())
    }

    pub fn release_outputs(&mut self) -> Result<()> {
        for port in &mut self.state_mut()?.oports {
            port.clear();
        }
        Ok(())
    }

    pub fn clear_input_ports(&mut self) -> Result<()> {
        self.release_inputs()
    }

    pub fn clear_output_ports(&mut self) -> Result<()> {
        self.release_outputs()
    }

    /// Drop the master state and reset every registered context.
    pub fn reset(&mut self) -> Result<()> {
        let st = self.state_mut()?;
        for handle in st.contexts.values() {
            handle.ctx.lock().reset();
        }
        st.master.reset();
        Ok(())
    }

    /// Retype a column in master state, the input staging table and the
    /// flattened transitional schema, converting existing data along the
    /// promotion lattice. The delta/prev/current tables follow for output
    /// columns so the next column pass sees one dtype everywhere.
    pub fn promote_column(&mut self, name: &str, new: Dtype) -> Result<()> {
        let from = self
            .input_schema
            .dtype_of(name)
            .ok_or_else(|| EngineError::NoSuchColumn(name.to_string()))?;
        if !from.can_promote_to(new) {
            return Err(EngineError::UnsupportedPromotion {
                column: name.to_string(),
                from,
                to: new,
            });
        }
        let st = self.state.as_mut().ok_or(EngineError::EngineNotInitialized)?;
        st.master.promote_column(name, new)?;
        st.iport.lock().promote_column(name, new)?;
        {
            let port = st.oport_mut(OutputPortId::Flattened);
            port.retype_schema(name, new);
            if port.table().column(name).is_some() {
                port.table_mut().promote_column(name, new)?;
            }
        }
        if self.output_schema.contains(name) {
            for id in [OutputPortId::Delta, OutputPortId::Prev, OutputPortId::Current] {
                let port = st.oport_mut(id);
                port.retype_schema(name, new);
                if port.table().column(name).is_some() {
                    port.table_mut().promote_column(name, new)?;
                }
            }
            for idx in [
                OutputPortId::Delta as usize,
                OutputPortId::Prev as usize,
                OutputPortId::Current as usize,
            ] {
                self.transitional_schemas[idx].retype_column(name, new);
            }
        }
        self.input_schema.retype_column(name, new);
        self.output_schema.retype_column(name, new);
        self.transitional_schemas[OutputPortId::Flattened as usize].retype_column(name, new);
        Ok(())
    }

    /// Register a context under a unique name.
    ///
    /// The context is reset, its computed columns are merged into the
    /// registry (and stubbed onto the master table), and if the engine
    /// already holds data the context is initialized with the keyed master
    /// rows rendered as a flattened table.
    pub fn register_context(&mut self, name: &str, ctx: SharedContext) -> Result<()> {
        let st = self.state.as_mut().ok_or(EngineError::EngineNotInitialized)?;
        let handle = ContextHandle::new(name, Arc::clone(&ctx));

        let mut guard = ctx.lock();
        guard.reset();
        let computed_columns = guard.config().computed_columns.clone();
        st.computed.add_columns(&computed_columns);

        if st.master.mapping_size() > 0 {
            let mut flattened = st.master.pkeyed_table();
            let all: Vec<ComputedColumn> = st.computed.iter().cloned().collect();
            for cc in &all {
                if let Err(err) = compute_column(cc, &mut flattened) {
                    log::error!("cannot compute column `{}`: {err}", cc.name);
                }
            }
            if !flattened.is_empty() {
                guard.step_begin();
                guard.notify_initial(&flattened);
                guard.step_end();
            }
        }

        // The master table needs the derived columns to exist before the
        // next update is processed.
        for cc in &computed_columns {
            match cc.output_dtype() {
                Some(dtype) => st.master.table_mut().add_column(&cc.name, dtype),
                None => log::error!("cannot add computed column `{}`: invalid function", cc.name),
            }
        }
        drop(guard);

        st.contexts.insert(handle.name.clone(), handle);
        Ok(())
    }

    /// Remove a context. Computed columns no longer referenced by any
    /// remaining context are dropped from the registry and from the tables
    /// that carried them.
    pub fn unregister_context(&mut self, name: &str) -> Result<()> {
        let st = self.state.as_mut().ok_or(EngineError::EngineNotInitialized)?;
        let Some(handle) = st.contexts.remove(name) else {
            return Ok(());
        };
        let names: Vec<String> = handle
            .ctx
            .lock()
            .config()
            .computed_columns
            .iter()
            .map(|cc| cc.name.clone())
            .collect();
        let removed = st.computed.remove_columns(names.iter().map(String::as_str));
        for column in &removed {
            st.master.table_mut().remove_column(column);
            for id in [
                OutputPortId::Delta,
                OutputPortId::Prev,
                OutputPortId::Current,
                OutputPortId::Transitions,
                OutputPortId::Diff,
            ] {
                st.oport_mut(id).table_mut().remove_column(column);
            }
        }
        Ok(())
    }

    /// Diagnostic listing of the registered contexts.
    pub fn registered_contexts(&self) -> Result<Vec<String>> {
        Ok(self
            .state()?
            .contexts
            .values()
            .map(|handle| format!("(ctx_name => {}, kind => {:?})", handle.name, handle.kind))
            .collect())
    }

    /// Names of contexts holding deltas their consumers have not read yet.
    pub fn contexts_last_updated(&self) -> Result<Vec<String>> {
        Ok(self
            .state()?
            .contexts
            .values()
            .filter(|handle| handle.ctx.lock().has_deltas())
            .map(|handle| handle.name.clone())
            .collect())
    }

    /// Drive one end-to-end processing pass over the accumulated input.
    ///
    /// Returns `Ok(false)` with no side effects when the input port is empty;
    /// otherwise flattens the batch, computes the transitional output set,
    /// applies the surviving rows to master, republishes the output ports,
    /// notifies every context, and returns the batch-level should-notify bit.
    /// Fatal errors abort before the master apply, leaving master unchanged.
    pub fn process_batch(&mut self) -> Result<bool> {
        let cfg = self.config;
        let out_names: Vec<String> = self.output_schema.names().map(str::to_owned).collect();
        let st = self.state.as_mut().ok_or(EngineError::EngineNotInitialized)?;

        st.was_updated = false;
        let flattened_batch = {
            let iport = st.iport.lock();
            if iport.is_empty() {
                return Ok(false);
            }
            iport.table().flatten()?
        };
        st.was_updated = true;

        let FlattenedBatch {
            table: mut flattened,
            reinserted,
        } = flattened_batch;
        if cfg.verify {
            flattened.verify()?;
            st.master.table().verify()?;
        }

        let rows = flattened.num_rows();
        log::trace!("process_batch: {rows} flattened rows");

        // Row lookups against master, op codes, and the previous-key rail.
        let mut lookup: Vec<RowLookup> = Vec::with_capacity(rows);
        let mut ops: Vec<Op> = Vec::with_capacity(rows);
        let mut prev_pkey_eq: Vec<bool> = Vec::with_capacity(rows);
        {
            let pkey_col = flattened
                .column(PSP_PKEY)
                .ok_or_else(|| EngineError::NoSuchColumn(PSP_PKEY.to_string()))?;
            let op_col = flattened
                .column(PSP_OP)
                .ok_or_else(|| EngineError::NoSuchColumn(PSP_OP.to_string()))?;
            let mut prev_key: Option<Scalar> = None;
            for idx in 0..rows {
                let key = pkey_col.get_scalar(idx);
                lookup.push(st.master.lookup(&key));
                let raw = op_col.value::<u8>(idx);
                ops.push(Op::from_u8(raw).ok_or(EngineError::UnknownOp { row: idx, op: raw })?);
                // Flatten leaves one row per key, so adjacent equal keys can
                // only mean a bug upstream; the re-insert marker is what
                // actually feeds the transition calculator.
                prev_pkey_eq.push(reinserted[idx] || prev_key.as_ref() == Some(&key));
                prev_key = Some(key);
            }
        }

        // First-load fast path: nothing to diff against.
        if st.master.mapping_size() == 0 {
            log::debug!("initial load of {rows} rows");
            let all: Vec<ComputedColumn> = st.computed.iter().cloned().collect();
            for cc in &all {
                if let Err(err) = compute_column(cc, &mut flattened) {
                    log::error!("cannot compute column `{}`: {err}", cc.name);
                }
            }
            for handle in st.contexts.values() {
                let mut ctx = handle.ctx.lock();
                ctx.reset();
                if !flattened.is_empty() {
                    ctx.step_begin();
                    ctx.notify_initial(&flattened);
                    ctx.step_end();
                }
            }
            st.master.update_master_table(&flattened)?;
            if cfg.verify {
                st.master.table().verify()?;
            }
            st.oport_mut(OutputPortId::Flattened)
                .set_table(Arc::new(flattened));
            st.iport.lock().release_or_clear();
            for port in &mut st.oports[1..] {
                port.clear();
            }
            // Initial loads always notify.
            return Ok(true);
        }

        st.iport.lock().release_or_clear();

        let mut pstate = ProcessState {
            lookup,
            ops,
            added_offset: Vec::new(),
            prev_pkey_eq,
        };
        let computed: Vec<ComputedColumn> = st.computed.iter().cloned().collect();

        // Reset the transitional tables and give them the derived columns:
        // stubs on transitions/diff, typed columns on delta/prev/current.
        for id in TRANSITIONAL_PORTS {
            st.oport_mut(id).table_mut().clear();
        }
        st.oport_mut(OutputPortId::Diff).table_mut().clear();
        {
            let table = st.oport_mut(OutputPortId::Transitions).table_mut();
            for cc in &computed {
                table.add_column(&cc.name, Dtype::U8);
            }
        }
        {
            let table = st.oport_mut(OutputPortId::Diff).table_mut();
            for cc in &computed {
                table.add_column(&cc.name, Dtype::Bool);
            }
        }
        for cc in &computed {
            if let Err(err) = recompute_column(cc, st.master.table(), &mut flattened, &pstate.lookup)
            {
                log::error!("cannot recompute column `{}`: {err}", cc.name);
            }
        }
        for id in [OutputPortId::Delta, OutputPortId::Prev, OutputPortId::Current] {
            let table = st.oport_mut(id).table_mut();
            for cc in &computed {
                if let Err(err) = compute_column(cc, table) {
                    log::error!("cannot compute column `{}`: {err}", cc.name);
                }
            }
        }
        for id in TRANSITIONAL_PORTS {
            st.oport_mut(id).table_mut().reserve(rows);
        }

        // Mask phase: survival, existed table, compacted offsets.
        let mask = mask_existed_rows(
            &mut pstate,
            &flattened,
            st.oport_mut(OutputPortId::Existed).table_mut(),
        )?;
        let mask_count = mask.count();
        for id in TRANSITIONAL_PORTS {
            st.oport_mut(id).table_mut().set_num_rows(mask_count);
        }
        st.oport_mut(OutputPortId::Diff).table_mut().set_num_rows(1);

        // The effective column set: user-visible columns plus every derived
        // column the contexts require.
        let mut names = out_names;
        names.extend(computed.iter().map(|cc| cc.name.clone()));

        let mut units: Vec<ColumnUnit> = Vec::with_capacity(names.len());
        for name in &names {
            let Some(flat_col) = flattened.column(name) else {
                log::warn!("column `{name}` absent from flattened batch, skipping");
                continue;
            };
            let dtype = flat_col.dtype();
            let present = st.oport(OutputPortId::Delta).table().column(name).is_some()
                && st.oport(OutputPortId::Prev).table().column(name).is_some()
                && st.oport(OutputPortId::Current).table().column(name).is_some()
                && st
                    .oport(OutputPortId::Transitions)
                    .table()
                    .column(name)
                    .is_some();
            if !present {
                log::warn!("column `{name}` missing from a transitional table, skipping");
                continue;
            }
            let delta = st
                .oport_mut(OutputPortId::Delta)
                .table_mut()
                .take_column(name)
                .expect("checked above");
            let prev = st
                .oport_mut(OutputPortId::Prev)
                .table_mut()
                .take_column(name)
                .expect("checked above");
            let current = st
                .oport_mut(OutputPortId::Current)
                .table_mut()
                .take_column(name)
                .expect("checked above");
            let transitions = st
                .oport_mut(OutputPortId::Transitions)
                .table_mut()
                .take_column(name)
                .expect("checked above");
            units.push(ColumnUnit {
                name: name.clone(),
                dtype,
                delta,
                prev,
                current,
                transitions,
                notify: false,
            });
        }

        // Per-column pass. Every worker owns its four transitional columns
        // and only reads the shared flattened/master tables, so the parallel
        // and serial paths are interchangeable.
        let pass_result: Result<()> = {
            let master_table = st.master.table();
            let run = |unit: &mut ColumnUnit| {
                process_column_unit(unit, &flattened, master_table, &pstate, &cfg)
            };
            if cfg.parallel {
                units.par_iter_mut().try_for_each(run)
            } else {
                units.iter_mut().try_for_each(run)
            }
        };

        for unit in units {
            let ColumnUnit {
                name,
                delta,
                prev,
                current,
                transitions,
                notify,
                ..
            } = unit;
            st.oport_mut(OutputPortId::Delta)
                .table_mut()
                .restore_column(&name, delta);
            st.oport_mut(OutputPortId::Prev)
                .table_mut()
                .restore_column(&name, prev);
            st.oport_mut(OutputPortId::Current)
                .table_mut()
                .restore_column(&name, current);
            st.oport_mut(OutputPortId::Transitions)
                .table_mut()
                .restore_column(&name, transitions);
            if let Some(col) = st
                .oport_mut(OutputPortId::Diff)
                .table_mut()
                .column_mut(&name)
            {
                col.set_value::<u8>(0, notify as u8);
                col.set_valid(0, true);
            }
        }
        pass_result?;

        // Derived columns over the freshly written transitional tables.
        for id in [OutputPortId::Delta, OutputPortId::Prev, OutputPortId::Current] {
            let table = st.oport_mut(id).table_mut();
            for cc in &computed {
                if let Err(err) = compute_column(cc, table) {
                    log::error!("cannot compute column `{}`: {err}", cc.name);
                }
            }
        }

        // Drop the rows that did not survive, apply to master, publish.
        let flattened_masked = if mask_count == rows {
            flattened
        } else {
            flattened.clone_masked(&mask)
        };
        if cfg.verify {
            flattened_masked.verify()?;
        }
        st.master.update_master_table(&flattened_masked)?;
        if cfg.verify {
            st.master.table().verify()?;
        }
        st.oport_mut(OutputPortId::Flattened)
            .set_table(Arc::new(flattened_masked));

        // The notification gate: OR across the diff table's single row.
        let mut should_notify = false;
        {
            let diff = st.oport(OutputPortId::Diff).table();
            for (name, _) in diff.schema().iter() {
                let col = diff.column(name).expect("iterating own schema");
                if col.len() > 0 && col.value::<u8>(0) != 0 {
                    should_notify = true;
                    break;
                }
            }
        }
        log::debug!("should notify userspace: {should_notify}");

        Self::notify_contexts(st, cfg.parallel);

        Ok(should_notify)
    }

    /// Fan the transitional output set out to every registered context.
    /// Each context's `step_begin`/`notify`/`step_end` runs strictly in
    /// order; distinct contexts may run in parallel.
    fn notify_contexts(st: &EngineState, parallel: bool) {
        if st.contexts.is_empty() {
            return;
        }
        let flattened: &DataTable = st.oport(OutputPortId::Flattened).table();
        let delta: &DataTable = st.oport(OutputPortId::Delta).table();
        let prev: &DataTable = st.oport(OutputPortId::Prev).table();
        let current: &DataTable = st.oport(OutputPortId::Current).table();
        let transitions: &DataTable = st.oport(OutputPortId::Transitions).table();
        let existed: &DataTable = st.oport(OutputPortId::Existed).table();
        let set = TransitionalSet {
            flattened,
            delta,
            prev,
            current,
            transitions,
            existed,
        };

        let handles: Vec<&ContextHandle> = st.contexts.values().collect();
        let notify_one = |handle: &&ContextHandle| {
            let mut ctx = handle.ctx.lock();
            ctx.step_begin();
            ctx.notify(&set);
            ctx.step_end();
        };
        if parallel {
            handles.par_iter().for_each(notify_one);
        } else {
            handles.iter().for_each(notify_one);
        }
    }
}
