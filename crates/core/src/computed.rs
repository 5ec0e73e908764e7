use indexmap::IndexMap;
use prism_types::{Dtype, Scalar};

use crate::column::Column;
use crate::error::{EngineError, Result};
use crate::state::RowLookup;
use crate::table::DataTable;

/// The fixed set of pure computations a derived column can reference.
///
/// `Invalid` stands for a function id that failed to resolve; registering it
/// is tolerated but every evaluation is logged and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputedFunction {
    Add,
    Subtract,
    Multiply,
    Divide,
    Abs,
    Negate,
    Sqrt,
    Pow2,
    Uppercase,
    Lowercase,
    Concat,
    Length,
    Invalid,
}

impl ComputedFunction {
    /// Output dtype of the computation, `None` for `Invalid`.
    pub fn return_dtype(self) -> Option<Dtype> {
        Some(match self {
            ComputedFunction::Add
            | ComputedFunction::Subtract
            | ComputedFunction::Multiply
            | ComputedFunction::Divide
            | ComputedFunction::Abs
            | ComputedFunction::Negate
            | ComputedFunction::Sqrt
            | ComputedFunction::Pow2 => Dtype::F64,
            ComputedFunction::Uppercase
            | ComputedFunction::Lowercase
            | ComputedFunction::Concat => Dtype::Str,
            ComputedFunction::Length => Dtype::I64,
            ComputedFunction::Invalid => return None,
        })
    }

    pub fn arity(self) -> usize {
        match self {
            ComputedFunction::Add
            | ComputedFunction::Subtract
            | ComputedFunction::Multiply
            | ComputedFunction::Divide
            | ComputedFunction::Concat => 2,
            _ => 1,
        }
    }
}

/// Definition of one derived column: output name, input column names and the
/// computation descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedColumn {
    pub name: String,
    pub inputs: Vec<String>,
    pub function: ComputedFunction,
}

impl ComputedColumn {
    pub fn new(name: impl Into<String>, inputs: Vec<String>, function: ComputedFunction) -> Self {
        ComputedColumn {
            name: name.into(),
            inputs,
            function,
        }
    }

    pub fn output_dtype(&self) -> Option<Dtype> {
        self.function.return_dtype()
    }
}

/// The set of derived columns currently required by any registered context.
///
/// Duplicate names across contexts share one physical column; a name is
/// dropped only when the last context referencing it unregisters.
#[derive(Default)]
pub struct ComputedColumnRegistry {
    columns: IndexMap<String, (ComputedColumn, usize)>,
}

impl ComputedColumnRegistry {
    pub fn add_columns(&mut self, columns: &[ComputedColumn]) {
        for cc in columns {
            match self.columns.get_mut(&cc.name) {
                Some((existing, refs)) => {
                    if existing != cc {
                        log::warn!(
                            "computed column `{}` re-registered with a different definition; keeping the first",
                            cc.name
                        );
                    }
                    *refs += 1;
                }
                None => {
                    self.columns.insert(cc.name.clone(), (cc.clone(), 1));
                }
            }
        }
    }

    /// Drop one reference per name, removing columns that reach zero.
    /// Returns the names actually removed.
    pub fn remove_columns<'a, I>(&mut self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut removed = Vec::new();
        for name in names {
            if let Some((_, refs)) = self.columns.get_mut(name) {
                *refs -= 1;
                if *refs == 0 {
                    self.columns.shift_remove(name);
                    removed.push(name.to_string());
                }
            }
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComputedColumn> {
        self.columns.values().map(|(cc, _)| cc)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Evaluate one computation over already-fetched arguments. Any missing or
/// mistyped argument yields `Null`.
pub(crate) fn eval_row(function: ComputedFunction, args: &[Scalar]) -> Scalar {
    fn num2(args: &[Scalar]) -> Option<(f64, f64)> {
        Some((args.first()?.as_f64()?, args.get(1)?.as_f64()?))
    }
    fn num1(args: &[Scalar]) -> Option<f64> {
        args.first()?.as_f64()
    }
    fn str1(args: &[Scalar]) -> Option<&str> {
        args.first()?.as_str()
    }

    let out = match function {
        ComputedFunction::Add => num2(args).map(|(a, b)| Scalar::F64(a + b)),
        ComputedFunction::Subtract => num2(args).map(|(a, b)| Scalar::F64(a - b)),
        ComputedFunction::Multiply => num2(args).map(|(a, b)| Scalar::F64(a * b)),
        ComputedFunction::Divide => {
            num2(args).and_then(|(a, b)| (b != 0.0).then(|| Scalar::F64(a / b)))
        }
        ComputedFunction::Abs => num1(args).map(|a| Scalar::F64(a.abs())),
        ComputedFunction::Negate => num1(args).map(|a| Scalar::F64(-a)),
        ComputedFunction::Sqrt => num1(args).and_then(|a| (a >= 0.0).then(|| Scalar::F64(a.sqrt()))),
        ComputedFunction::Pow2 => num1(args).map(|a| Scalar::F64(a * a)),
        ComputedFunction::Uppercase => str1(args).map(|s| Scalar::Str(s.to_uppercase().into())),
        ComputedFunction::Lowercase => str1(args).map(|s| Scalar::Str(s.to_lowercase().into())),
        ComputedFunction::Concat => match (args.first().and_then(Scalar::as_str), args.get(1).and_then(Scalar::as_str)) {
            (Some(a), Some(b)) => Some(Scalar::Str(format!("{a}{b}").into())),
            _ => None,
        },
        ComputedFunction::Length => str1(args).map(|s| Scalar::I64(s.chars().count() as i64)),
        ComputedFunction::Invalid => None,
    };
    out.unwrap_or(Scalar::Null)
}

/// Apply a computation over `table`'s own columns, inserting (or replacing)
/// the output column.
pub(crate) fn compute_column(cc: &ComputedColumn, table: &mut DataTable) -> Result<()> {
    let out_dtype = cc
        .function
        .return_dtype()
        .ok_or_else(|| EngineError::InvalidComputedFunction {
            column: cc.name.clone(),
        })?;
    let rows = table.num_rows();
    let mut out = Column::new(out_dtype);
    out.reserve(rows);
    {
        let inputs: Vec<&Column> = cc
            .inputs
            .iter()
            .map(|name| {
                table
                    .column(name)
                    .ok_or_else(|| EngineError::NoSuchColumn(name.clone()))
            })
            .collect::<Result<_>>()?;
        let mut args = Vec::with_capacity(inputs.len());
        for idx in 0..rows {
            args.clear();
            args.extend(inputs.iter().map(|c| c.get_scalar(idx)));
            out.push_scalar(&eval_row(cc.function, &args));
        }
    }
    table.insert_column(&cc.name, out);
    Ok(())
}

/// Recompute a derived column on `flattened` for changed rows, reading each
/// input cell from the batch when it is valid and falling back to the master
/// row the key maps to.
pub(crate) fn recompute_column(
    cc: &ComputedColumn,
    master: &DataTable,
    flattened: &mut DataTable,
    lookups: &[RowLookup],
) -> Result<()> {
    let out_dtype = cc
        .function
        .return_dtype()
        .ok_or_else(|| EngineError::InvalidComputedFunction {
            column: cc.name.clone(),
        })?;
    let rows = flattened.num_rows();
    let mut out = Column::new(out_dtype);
    out.reserve(rows);
    {
        let inputs: Vec<(&Column, Option<&Column>)> = cc
            .inputs
            .iter()
            .map(|name| -> Result<(&Column, Option<&Column>)> {
                let flat = flattened
                    .column(name)
                    .ok_or_else(|| EngineError::NoSuchColumn(name.clone()))?;
                Ok((flat, master.column(name)))
            })
            .collect::<Result<_>>()?;
        let mut args = Vec::with_capacity(inputs.len());
        for idx in 0..rows {
            args.clear();
            for (flat, master_col) in &inputs {
                let arg = if flat.is_valid(idx) {
                    flat.get_scalar(idx)
                } else if lookups[idx].exists {
                    master_col
                        .map(|col| col.get_scalar(lookups[idx].slot))
                        .unwrap_or(Scalar::Null)
                } else {
                    Scalar::Null
                };
                args.push(arg);
            }
            out.push_scalar(&eval_row(cc.function, &args));
        }
    }
    flattened.insert_column(&cc.name, out);
    Ok(())
}
