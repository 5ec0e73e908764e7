use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use prism_core::{
    ComputedColumn, ComputedFunction, Context, ContextConfig, ContextKind, DataTable, Engine,
    EngineConfig, EngineError, OutputPortId, Pool, Schema, SharedContext, TransitionalSet,
    PSP_EXISTED, PSP_OP, PSP_PKEY,
};
use prism_types::{Dtype, Op, Scalar, Transition};
use proptest::collection::vec;
use proptest::option;
use proptest::prelude::*;

fn output_schema() -> Schema {
    Schema::new([("a", Dtype::I64), ("b", Dtype::Str)])
}

fn input_schema() -> Schema {
    Schema::pkeyed(Dtype::I32, &output_schema())
}

fn engine_with(config: EngineConfig) -> Engine {
    let mut engine = Engine::new(input_schema(), output_schema(), config);
    engine.init().unwrap();
    engine
}

fn engine() -> Engine {
    engine_with(EngineConfig::default())
}

fn batch(rows: &[(i32, Op, Option<i64>, Option<&str>)]) -> DataTable {
    let mut t = DataTable::new(&input_schema());
    t.set_num_rows(rows.len());
    for (idx, (pkey, op, a, b)) in rows.iter().enumerate() {
        t.column_mut(PSP_PKEY)
            .unwrap()
            .set_scalar(idx, &Scalar::I32(*pkey));
        t.column_mut(PSP_OP)
            .unwrap()
            .set_scalar(idx, &Scalar::U8(op.as_u8()));
        if let Some(a) = a {
            t.column_mut("a").unwrap().set_scalar(idx, &Scalar::I64(*a));
        }
        if let Some(b) = b {
            t.column_mut("b")
                .unwrap()
                .set_scalar(idx, &Scalar::Str((*b).into()));
        }
    }
    t
}

/// Load the two-row S1 dataset and return the engine.
fn loaded_engine() -> Engine {
    let mut e = engine();
    e.send(&batch(&[
        (1, Op::Insert, Some(10), Some("x")),
        (2, Op::Insert, Some(20), Some("y")),
    ]))
    .unwrap();
    assert!(e.process_batch().unwrap());
    e
}

fn trans_code(engine: &Engine, column: &str, row: usize) -> u8 {
    let table = engine.output_table(OutputPortId::Transitions).unwrap();
    match table.column(column).unwrap().get_scalar(row) {
        Scalar::U8(code) => code,
        other => panic!("transitions cell is {other:?}"),
    }
}

fn diff_bit(engine: &Engine, column: &str) -> bool {
    let table = engine.output_table(OutputPortId::Diff).unwrap();
    match table.column(column).unwrap().get_scalar(0) {
        Scalar::Bool(bit) => bit,
        other => panic!("diff cell is {other:?}"),
    }
}

fn master_cell(engine: &Engine, pkey: i32, column: &str) -> Scalar {
    let view = engine.pkeyed_table().unwrap();
    for row in 0..view.num_rows() {
        if view.column(PSP_PKEY).unwrap().get_scalar(row) == Scalar::I32(pkey) {
            return view.column(column).unwrap().get_scalar(row);
        }
    }
    panic!("pkey {pkey} not found in master view");
}

#[test]
fn s1_initial_load() {
    let e = loaded_engine();
    assert_eq!(e.mapping_size().unwrap(), 2);
    let flattened = e.output_table(OutputPortId::Flattened).unwrap();
    assert_eq!(flattened.num_rows(), 2);
    assert_eq!(master_cell(&e, 1, "a"), Scalar::I64(10));
    assert_eq!(master_cell(&e, 2, "b"), Scalar::Str("y".into()));
    assert!(e.was_updated());
}

#[test]
fn s2_pure_noop_update() {
    let mut e = loaded_engine();
    let before = e.pkeyed_table().unwrap();
    e.send(&batch(&[(1, Op::Insert, Some(10), Some("x"))])).unwrap();
    let notified = e.process_batch().unwrap();
    assert!(!notified);
    assert!(!diff_bit(&e, "a"));
    assert!(!diff_bit(&e, "b"));
    // Master is identical to its post-first-batch state.
    assert_eq!(e.pkeyed_table().unwrap(), before);
    assert_eq!(trans_code(&e, "a", 0), Transition::EqTt.as_u8());
    assert_eq!(trans_code(&e, "b", 0), Transition::EqTt.as_u8());
}

#[test]
fn s3_partial_update() {
    let mut e = loaded_engine();
    e.send(&batch(&[(1, Op::Insert, None, Some("z"))])).unwrap();
    let notified = e.process_batch().unwrap();
    assert!(notified);
    assert_eq!(master_cell(&e, 1, "a"), Scalar::I64(10));
    assert_eq!(master_cell(&e, 1, "b"), Scalar::Str("z".into()));
    assert_eq!(trans_code(&e, "a", 0), Transition::EqTt.as_u8());
    assert_eq!(trans_code(&e, "b", 0), Transition::NeqTt.as_u8());
    assert!(!diff_bit(&e, "a"));
    assert!(diff_bit(&e, "b"));
    // The current table falls back to the previous value on the partial cell.
    let current = e.output_table(OutputPortId::Current).unwrap();
    assert_eq!(current.column("a").unwrap().get_scalar(0), Scalar::I64(10));
    let prev = e.output_table(OutputPortId::Prev).unwrap();
    assert_eq!(
        prev.column("b").unwrap().get_scalar(0),
        Scalar::Str("x".into())
    );
}

#[test]
fn s4_delete_existing() {
    let mut e = loaded_engine();
    e.send(&batch(&[(2, Op::Delete, None, None)])).unwrap();
    let notified = e.process_batch().unwrap();
    assert!(notified);
    assert_eq!(e.mapping_size().unwrap(), 1);
    assert_eq!(trans_code(&e, "a", 0), Transition::NeqTdf.as_u8());
    // The delta carries the negated previous value.
    let delta = e.output_table(OutputPortId::Delta).unwrap();
    assert_eq!(delta.column("a").unwrap().get_scalar(0), Scalar::I64(-20));
    // Deleted keys are not observable from the pkeyed view.
    assert!(!e.has_pkey(&Scalar::I32(2)).unwrap());
    assert_eq!(e.pkeys().unwrap(), vec![Scalar::I32(1)]);
}

#[test]
fn s5_delete_missing_is_dropped() {
    let mut e = loaded_engine();
    let before = e.pkeyed_table().unwrap();
    e.send(&batch(&[(99, Op::Delete, None, None)])).unwrap();
    let notified = e.process_batch().unwrap();
    assert!(!notified);
    assert_eq!(e.pkeyed_table().unwrap(), before);
    // No surviving rows at all.
    let existed = e.output_table(OutputPortId::Existed).unwrap();
    assert_eq!(existed.num_rows(), 0);
    assert_eq!(e.output_table(OutputPortId::Prev).unwrap().num_rows(), 0);
}

#[test]
fn s6_intra_batch_delete_then_reinsert() {
    let mut e = loaded_engine();
    e.send(&batch(&[
        (1, Op::Delete, None, None),
        (1, Op::Insert, Some(10), Some("x")),
    ]))
    .unwrap();
    let notified = e.process_batch().unwrap();
    // Values equal the pre-batch master row, so the batch is a no-op for
    // the notification gate.
    assert!(!notified);
    // One surviving flattened row.
    let existed = e.output_table(OutputPortId::Existed).unwrap();
    assert_eq!(existed.num_rows(), 1);
    assert_eq!(
        existed.column(PSP_EXISTED).unwrap().get_scalar(0),
        Scalar::Bool(false)
    );
    assert_eq!(trans_code(&e, "a", 0), Transition::NeqTdt.as_u8());
    assert_eq!(trans_code(&e, "b", 0), Transition::NeqTdt.as_u8());
    assert_eq!(master_cell(&e, 1, "a"), Scalar::I64(10));
    assert_eq!(master_cell(&e, 1, "b"), Scalar::Str("x".into()));

    // Changed values latch the notify bit.
    e.send(&batch(&[
        (1, Op::Delete, None, None),
        (1, Op::Insert, Some(11), Some("x")),
    ]))
    .unwrap();
    assert!(e.process_batch().unwrap());
    assert_eq!(trans_code(&e, "a", 0), Transition::NeqTdt.as_u8());
    assert_eq!(master_cell(&e, 1, "a"), Scalar::I64(11));
}

#[test]
fn delete_then_reinsert_of_absent_key_is_a_plain_appearance() {
    let mut e = loaded_engine();
    e.send(&batch(&[
        (7, Op::Delete, None, None),
        (7, Op::Insert, Some(5), Some("w")),
    ]))
    .unwrap();
    assert!(e.process_batch().unwrap());
    assert_eq!(trans_code(&e, "a", 0), Transition::NeqFt.as_u8());
    assert_eq!(master_cell(&e, 7, "a"), Scalar::I64(5));
}

#[test]
fn transitional_tables_align_after_dropped_rows() {
    let mut e = loaded_engine();
    // Row 0 (delete of a missing key) is dropped; row 1 compacts to slot 0.
    e.send(&batch(&[
        (99, Op::Delete, None, None),
        (1, Op::Insert, Some(11), Some("x")),
    ]))
    .unwrap();
    assert!(e.process_batch().unwrap());
    let existed = e.output_table(OutputPortId::Existed).unwrap();
    assert_eq!(existed.num_rows(), 1);
    assert_eq!(
        existed.column(PSP_EXISTED).unwrap().get_scalar(0),
        Scalar::Bool(true)
    );
    let prev = e.output_table(OutputPortId::Prev).unwrap();
    let current = e.output_table(OutputPortId::Current).unwrap();
    let delta = e.output_table(OutputPortId::Delta).unwrap();
    assert_eq!(prev.num_rows(), 1);
    assert_eq!(prev.column("a").unwrap().get_scalar(0), Scalar::I64(10));
    assert_eq!(current.column("a").unwrap().get_scalar(0), Scalar::I64(11));
    assert_eq!(delta.column("a").unwrap().get_scalar(0), Scalar::I64(1));
    assert_eq!(trans_code(&e, "a", 0), Transition::NeqTt.as_u8());
    // The flattened port publishes the masked table.
    assert_eq!(
        e.output_table(OutputPortId::Flattened).unwrap().num_rows(),
        1
    );
}

#[test]
fn flatten_matches_last_write_alone() {
    // [INSERT k v1, INSERT k v2] in one batch leaves master identical to
    // submitting [INSERT k v2] alone.
    let mut both = engine();
    both.send(&batch(&[
        (1, Op::Insert, Some(1), Some("one")),
        (1, Op::Insert, Some(2), Some("two")),
    ]))
    .unwrap();
    both.process_batch().unwrap();

    let mut last_only = engine();
    last_only
        .send(&batch(&[(1, Op::Insert, Some(2), Some("two"))]))
        .unwrap();
    last_only.process_batch().unwrap();

    assert_eq!(
        both.pkeyed_table().unwrap(),
        last_only.pkeyed_table().unwrap()
    );
    assert_eq!(
        both.output_table(OutputPortId::Flattened).unwrap().num_rows(),
        1
    );
}

#[test]
fn new_row_with_all_null_cells_does_not_notify() {
    let mut e = loaded_engine();
    e.send(&batch(&[(3, Op::Insert, None, None)])).unwrap();
    let notified = e.process_batch().unwrap();
    assert!(!notified);
    assert_eq!(e.mapping_size().unwrap(), 3);
    assert_eq!(trans_code(&e, "a", 0), Transition::NeqFt.as_u8());
    assert_eq!(master_cell(&e, 3, "a"), Scalar::Null);
}

#[test]
fn backout_flag_suppresses_the_invalid_appearance_clause() {
    let mut e = engine_with(EngineConfig {
        backout_invalid_neq_ft: true,
        ..EngineConfig::default()
    });
    e.send(&batch(&[(1, Op::Insert, Some(10), Some("x"))])).unwrap();
    e.process_batch().unwrap();
    e.send(&batch(&[(3, Op::Insert, None, None)])).unwrap();
    e.process_batch().unwrap();
    assert_eq!(trans_code(&e, "a", 0), Transition::EqFf.as_u8());
}

#[test]
fn unsigned_delta_wraps_and_min_negation_does_not_panic() {
    let out = Schema::new([("c", Dtype::U8), ("a", Dtype::I64)]);
    let mut e = Engine::new(Schema::pkeyed(Dtype::I32, &out), out.clone(), EngineConfig::default());
    e.init().unwrap();

    let mut load = DataTable::new(e.input_schema());
    load.set_num_rows(1);
    load.column_mut(PSP_PKEY).unwrap().set_scalar(0, &Scalar::I32(1));
    load.column_mut(PSP_OP)
        .unwrap()
        .set_scalar(0, &Scalar::U8(Op::Insert.as_u8()));
    load.column_mut("c").unwrap().set_scalar(0, &Scalar::U8(3));
    load.column_mut("a")
        .unwrap()
        .set_scalar(0, &Scalar::I64(i64::MIN));
    e.send(&load).unwrap();
    e.process_batch().unwrap();

    let mut update = load.clone();
    update.column_mut("c").unwrap().set_scalar(0, &Scalar::U8(1));
    e.send(&update).unwrap();
    assert!(e.process_batch().unwrap());
    let delta = e.output_table(OutputPortId::Delta).unwrap();
    // 1 - 3 wraps to 254 in u8.
    assert_eq!(delta.column("c").unwrap().get_scalar(0), Scalar::U8(254));

    let mut del = DataTable::new(e.input_schema());
    del.set_num_rows(1);
    del.column_mut(PSP_PKEY).unwrap().set_scalar(0, &Scalar::I32(1));
    del.column_mut(PSP_OP)
        .unwrap()
        .set_scalar(0, &Scalar::U8(Op::Delete.as_u8()));
    e.send(&del).unwrap();
    assert!(e.process_batch().unwrap());
    let delta = e.output_table(OutputPortId::Delta).unwrap();
    // Negating i64::MIN wraps back to itself instead of overflowing.
    assert_eq!(
        delta.column("a").unwrap().get_scalar(0),
        Scalar::I64(i64::MIN)
    );
}

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LogData {
    resets: usize,
    steps: Vec<String>,
    initial_rows: Vec<usize>,
    notifies: usize,
    last_delta_rows: usize,
    last_trans_a: Vec<u8>,
}

struct RecordingContext {
    kind: ContextKind,
    config: ContextConfig,
    log: Arc<Mutex<LogData>>,
    deltas: bool,
}

impl RecordingContext {
    fn shared(kind: ContextKind, config: ContextConfig) -> (SharedContext, Arc<Mutex<LogData>>) {
        let log = Arc::new(Mutex::new(LogData::default()));
        let ctx: SharedContext = Arc::new(Mutex::new(RecordingContext {
            kind,
            config,
            log: Arc::clone(&log),
            deltas: false,
        }));
        (ctx, log)
    }
}

impl Context for RecordingContext {
    fn kind(&self) -> ContextKind {
        self.kind
    }

    fn config(&self) -> &ContextConfig {
        &self.config
    }

    fn reset(&mut self) {
        self.deltas = false;
        self.log.lock().resets += 1;
    }

    fn step_begin(&mut self) {
        self.log.lock().steps.push("begin".into());
    }

    fn step_end(&mut self) {
        self.log.lock().steps.push("end".into());
    }

    fn notify_initial(&mut self, flattened: &DataTable) {
        let mut log = self.log.lock();
        log.steps.push("initial".into());
        log.initial_rows.push(flattened.num_rows());
    }

    fn notify(&mut self, set: &TransitionalSet<'_>) {
        self.deltas = true;
        let mut log = self.log.lock();
        log.steps.push("notify".into());
        log.notifies += 1;
        log.last_delta_rows = set.delta.num_rows();
        log.last_trans_a = (0..set.transitions.num_rows())
            .map(|row| match set.transitions.column("a").unwrap().get_scalar(row) {
                Scalar::U8(code) => code,
                other => panic!("transitions cell is {other:?}"),
            })
            .collect();
    }

    fn has_deltas(&self) -> bool {
        self.deltas
    }
}

#[test]
fn contexts_get_the_transitional_set_in_strict_step_order() {
    let mut e = engine();
    let (ctx, log) = RecordingContext::shared(ContextKind::ZeroSided, ContextConfig::default());
    e.register_context("view", ctx).unwrap();

    e.send(&batch(&[(1, Op::Insert, Some(10), Some("x"))])).unwrap();
    e.process_batch().unwrap();
    // First load initializes from the flattened batch.
    {
        let log = log.lock();
        assert_eq!(log.resets, 2); // once at registration, once on first load
        assert_eq!(log.steps, vec!["begin", "initial", "end"]);
        assert_eq!(log.initial_rows, vec![1]);
    }

    e.send(&batch(&[(1, Op::Insert, Some(11), Some("x"))])).unwrap();
    e.process_batch().unwrap();
    {
        let log = log.lock();
        assert_eq!(
            log.steps,
            vec!["begin", "initial", "end", "begin", "notify", "end"]
        );
        assert_eq!(log.notifies, 1);
        assert_eq!(log.last_delta_rows, 1);
        assert_eq!(log.last_trans_a, vec![Transition::NeqTt.as_u8()]);
    }
    assert_eq!(e.contexts_last_updated().unwrap(), vec!["view".to_string()]);
}

#[test]
fn registering_against_a_loaded_engine_initializes_from_state() {
    let mut e = loaded_engine();
    let (ctx, log) = RecordingContext::shared(ContextKind::OneSided, ContextConfig::default());
    e.register_context("late", ctx).unwrap();
    let log = log.lock();
    assert_eq!(log.initial_rows, vec![2]);
    assert_eq!(log.steps, vec!["begin", "initial", "end"]);
    let listing = e.registered_contexts().unwrap();
    assert_eq!(listing.len(), 1);
    assert!(listing[0].contains("late"));
}

#[test]
fn computed_columns_flow_through_every_table() {
    let mut e = engine();
    let config = ContextConfig {
        computed_columns: vec![ComputedColumn::new(
            "a2",
            vec!["a".into()],
            ComputedFunction::Pow2,
        )],
    };
    let (ctx, _log) = RecordingContext::shared(ContextKind::ZeroSided, config);
    e.register_context("squares", ctx).unwrap();

    e.send(&batch(&[(1, Op::Insert, Some(10), Some("x"))])).unwrap();
    e.process_batch().unwrap();
    // The initial flattened table carries the derived column.
    let flattened = e.output_table(OutputPortId::Flattened).unwrap();
    assert_eq!(
        flattened.column("a2").unwrap().get_scalar(0),
        Scalar::F64(100.0)
    );
    assert_eq!(master_cell(&e, 1, "a2"), Scalar::F64(100.0));

    e.send(&batch(&[(1, Op::Insert, Some(12), Some("x"))])).unwrap();
    assert!(e.process_batch().unwrap());
    let prev = e.output_table(OutputPortId::Prev).unwrap();
    let current = e.output_table(OutputPortId::Current).unwrap();
    assert_eq!(prev.column("a2").unwrap().get_scalar(0), Scalar::F64(100.0));
    assert_eq!(
        current.column("a2").unwrap().get_scalar(0),
        Scalar::F64(144.0)
    );
    // The transitions table grew a code column for the derived column too.
    let transitions = e.output_table(OutputPortId::Transitions).unwrap();
    assert!(transitions.column("a2").is_some());
    assert_eq!(master_cell(&e, 1, "a2"), Scalar::F64(144.0));
}

#[test]
fn invalid_computed_function_is_skipped_not_fatal() {
    let mut e = engine();
    let config = ContextConfig {
        computed_columns: vec![ComputedColumn::new(
            "broken",
            vec!["a".into()],
            ComputedFunction::Invalid,
        )],
    };
    let (ctx, log) = RecordingContext::shared(ContextKind::ZeroSided, config);
    e.register_context("broken_view", ctx).unwrap();

    e.send(&batch(&[(1, Op::Insert, Some(10), Some("x"))])).unwrap();
    e.process_batch().unwrap();
    e.send(&batch(&[(1, Op::Insert, Some(11), Some("x"))])).unwrap();
    // Processing succeeds; the broken column simply never materializes.
    assert!(e.process_batch().unwrap());
    assert!(e.table().unwrap().column("broken").is_none());
    let flattened = e.output_table(OutputPortId::Flattened).unwrap();
    assert!(flattened.column("broken").is_none());
    assert_eq!(log.lock().notifies, 1);
}

#[test]
fn shared_computed_columns_survive_partial_unregistration() {
    let mut e = engine();
    let cc = ComputedColumn::new("a2", vec!["a".into()], ComputedFunction::Pow2);
    let config = ContextConfig {
        computed_columns: vec![cc.clone()],
    };
    let (first, _) = RecordingContext::shared(ContextKind::ZeroSided, config.clone());
    let (second, _) = RecordingContext::shared(ContextKind::TwoSided, config);
    e.register_context("first", first).unwrap();
    e.register_context("second", second).unwrap();

    e.send(&batch(&[(1, Op::Insert, Some(3), Some("x"))])).unwrap();
    e.process_batch().unwrap();
    assert_eq!(master_cell(&e, 1, "a2"), Scalar::F64(9.0));

    // One context still references the column.
    e.unregister_context("first").unwrap();
    assert!(e.table().unwrap().column("a2").is_some());

    e.unregister_context("second").unwrap();
    assert!(e.table().unwrap().column("a2").is_none());
}

// ---------------------------------------------------------------------------
// Pool and update task
// ---------------------------------------------------------------------------

#[test]
fn pool_runs_engines_and_gates_the_userspace_hook() {
    let pool = Pool::new();
    let shared = pool
        .register_engine(Engine::new(
            input_schema(),
            output_schema(),
            EngineConfig::default(),
        ))
        .unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = Arc::clone(&fired);
        pool.set_update_delegate(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Nothing pending: early return, no epoch bump.
    assert!(!pool.process_all().unwrap());
    assert_eq!(pool.epoch(), 0);

    pool.send(0, &batch(&[(1, Op::Insert, Some(10), Some("x"))]))
        .unwrap();
    assert!(pool.has_data_remaining());
    assert!(pool.process_all().unwrap());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(pool.epoch(), 1);
    assert!(!pool.has_data_remaining());
    // The update task cleared the output ports after notifying.
    assert_eq!(
        shared
            .lock()
            .output_table(OutputPortId::Flattened)
            .unwrap()
            .num_rows(),
        0
    );

    // A pure no-op batch processes but does not wake userspace.
    pool.send(0, &batch(&[(1, Op::Insert, Some(10), Some("x"))]))
        .unwrap();
    assert!(!pool.process_all().unwrap());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(pool.epoch(), 2);

    assert!(matches!(
        pool.send(9, &batch(&[])),
        Err(EngineError::UnknownEngine(9))
    ));
}

// ---------------------------------------------------------------------------
// Promotion, errors, parallel parity
// ---------------------------------------------------------------------------

#[test]
fn promote_value_column_and_pkey() {
    let mut e = loaded_engine();
    e.promote_column("a", Dtype::F64).unwrap();
    assert_eq!(master_cell(&e, 1, "a"), Scalar::F64(10.0));
    assert_eq!(e.input_schema().dtype_of("a"), Some(Dtype::F64));

    // Later batches arrive in the promoted schema and still diff correctly.
    let mut update = DataTable::new(e.input_schema());
    update.set_num_rows(1);
    update
        .column_mut(PSP_PKEY)
        .unwrap()
        .set_scalar(0, &Scalar::I32(1));
    update
        .column_mut(PSP_OP)
        .unwrap()
        .set_scalar(0, &Scalar::U8(Op::Insert.as_u8()));
    update
        .column_mut("a")
        .unwrap()
        .set_scalar(0, &Scalar::F64(10.5));
    update
        .column_mut("b")
        .unwrap()
        .set_scalar(0, &Scalar::Str("x".into()));
    e.send(&update).unwrap();
    assert!(e.process_batch().unwrap());
    assert_eq!(master_cell(&e, 1, "a"), Scalar::F64(10.5));
    let delta = e.output_table(OutputPortId::Delta).unwrap();
    assert_eq!(delta.column("a").unwrap().get_scalar(0), Scalar::F64(0.5));

    // Promoting the key retypes the index as well.
    e.promote_column(PSP_PKEY, Dtype::I64).unwrap();
    assert!(e.has_pkey(&Scalar::I64(1)).unwrap());

    assert!(matches!(
        e.promote_column("b", Dtype::I64),
        Err(EngineError::UnsupportedPromotion { .. })
    ));
    assert!(matches!(
        e.promote_column("missing", Dtype::I64),
        Err(EngineError::NoSuchColumn(_))
    ));
}

#[test]
fn uninitialized_engine_refuses_all_operations() {
    let e = Engine::new(input_schema(), output_schema(), EngineConfig::default());
    assert!(matches!(
        e.send(&batch(&[])),
        Err(EngineError::EngineNotInitialized)
    ));
    assert!(matches!(
        e.mapping_size(),
        Err(EngineError::EngineNotInitialized)
    ));
    let mut e = e;
    assert!(matches!(
        e.process_batch(),
        Err(EngineError::EngineNotInitialized)
    ));
}

#[test]
fn unknown_op_aborts_the_batch_and_leaves_master_untouched() {
    let mut e = loaded_engine();
    let before = e.pkeyed_table().unwrap();
    let mut bad = batch(&[(1, Op::Insert, Some(99), Some("boom"))]);
    bad.column_mut(PSP_OP).unwrap().set_scalar(0, &Scalar::U8(7));
    e.send(&bad).unwrap();
    assert!(matches!(
        e.process_batch(),
        Err(EngineError::UnknownOp { row: 0, op: 7 })
    ));
    assert_eq!(e.pkeyed_table().unwrap(), before);
    // The poisoned input stays queued; clearing it restores normal service.
    e.clear_input_ports().unwrap();
    e.send(&batch(&[(1, Op::Insert, Some(11), Some("x"))])).unwrap();
    assert!(e.process_batch().unwrap());
    assert_eq!(master_cell(&e, 1, "a"), Scalar::I64(11));
}

#[test]
fn send_rejects_schema_mismatch_synchronously() {
    let e = engine();
    let wrong = DataTable::new(&Schema::pkeyed(
        Dtype::I32,
        &Schema::new([("a", Dtype::I64), ("b", Dtype::I64)]),
    ));
    assert!(matches!(
        e.send(&wrong),
        Err(EngineError::SchemaMismatch(_))
    ));
}

#[test]
fn parallel_and_serial_paths_agree() {
    let drive = |config: EngineConfig| {
        let mut e = engine_with(config);
        e.send(&batch(&[
            (1, Op::Insert, Some(10), Some("x")),
            (2, Op::Insert, Some(20), Some("y")),
        ]))
        .unwrap();
        e.process_batch().unwrap();
        e.send(&batch(&[
            (1, Op::Insert, None, Some("z")),
            (2, Op::Delete, None, None),
            (3, Op::Insert, Some(30), None),
        ]))
        .unwrap();
        let notified = e.process_batch().unwrap();
        (
            notified,
            e.pkeyed_table().unwrap(),
            (*e.output_table(OutputPortId::Transitions).unwrap()).clone(),
            (*e.output_table(OutputPortId::Delta).unwrap()).clone(),
        )
    };
    let serial = drive(EngineConfig::default());
    let parallel = drive(EngineConfig {
        parallel: true,
        ..EngineConfig::default()
    });
    assert_eq!(serial.0, parallel.0);
    assert_eq!(serial.1, parallel.1);
    assert_eq!(serial.2, parallel.2);
    assert_eq!(serial.3, parallel.3);
}

#[test]
fn verify_mode_passes_on_the_happy_path() {
    let mut e = engine_with(EngineConfig {
        verify: true,
        ..EngineConfig::default()
    });
    e.send(&batch(&[(1, Op::Insert, Some(1), Some("v"))])).unwrap();
    assert!(e.process_batch().unwrap());
    e.send(&batch(&[(1, Op::Delete, None, None)])).unwrap();
    assert!(e.process_batch().unwrap());
    assert_eq!(e.mapping_size().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

type Row = (i32, Option<i64>, Option<&'static str>);

fn insert_batch(rows: &[Row]) -> DataTable {
    let rows: Vec<(i32, Op, Option<i64>, Option<&str>)> = rows
        .iter()
        .map(|(k, a, b)| (*k, Op::Insert, *a, *b))
        .collect();
    batch(&rows)
}

proptest! {
    /// Flatten of an insert-only batch is column-wise last-valid-wins.
    #[test]
    fn flatten_is_last_valid_wins(rows in vec(
        (0..4i32, option::of(0..10i64), option::of(prop::sample::select(vec!["", "x", "yy"]))),
        1..12,
    )) {
        let mut e = engine();
        e.send(&insert_batch(&rows)).unwrap();
        e.process_batch().unwrap();

        let mut model: IndexMap<i32, (Option<i64>, Option<&str>)> = IndexMap::new();
        for (k, a, b) in &rows {
            let entry = model.entry(*k).or_insert((None, None));
            if a.is_some() {
                entry.0 = *a;
            }
            if b.is_some() {
                entry.1 = *b;
            }
        }

        let view = e.pkeyed_table().unwrap();
        prop_assert_eq!(view.num_rows(), model.len());
        for (row, (k, (a, b))) in model.iter().enumerate() {
            prop_assert_eq!(view.column(PSP_PKEY).unwrap().get_scalar(row), Scalar::I32(*k));
            let want_a = a.map_or(Scalar::Null, Scalar::I64);
            let want_b = b.map_or(Scalar::Null, |s| Scalar::Str(s.into()));
            prop_assert_eq!(view.column("a").unwrap().get_scalar(row), want_a);
            prop_assert_eq!(view.column("b").unwrap().get_scalar(row), want_b);
        }
    }

    /// Resubmitting the accumulated rows is a no-op: no notification, and
    /// master is unchanged.
    #[test]
    fn resubmission_is_idempotent(rows in vec(
        (0..4i32, option::of(0..10i64), option::of(prop::sample::select(vec!["", "x", "yy"]))),
        1..10,
    )) {
        let mut e = engine();
        e.send(&insert_batch(&rows)).unwrap();
        e.process_batch().unwrap();
        let before = e.pkeyed_table().unwrap();

        let replay: Vec<Row> = {
            let mut model: IndexMap<i32, (Option<i64>, Option<&'static str>)> = IndexMap::new();
            for (k, a, b) in &rows {
                let entry = model.entry(*k).or_insert((None, None));
                if a.is_some() { entry.0 = *a; }
                if b.is_some() { entry.1 = *b; }
            }
            model.iter().map(|(k, (a, b))| (*k, *a, *b)).collect()
        };
        e.send(&insert_batch(&replay)).unwrap();
        let notified = e.process_batch().unwrap();
        prop_assert!(!notified);
        prop_assert_eq!(e.pkeyed_table().unwrap(), before);
    }
}
