use std::collections::HashMap;

use prism_types::Dtype;

use crate::error::SchemaError;

/// Reserved column carrying the user-supplied primary key.
pub const PSP_PKEY: &str = "psp_pkey";
/// Reserved column carrying the row operation code.
pub const PSP_OP: &str = "psp_op";
/// Secondary bookkeeping key, set equal to `psp_pkey` by ingestion unless an
/// index column is specified.
pub const PSP_OKEY: &str = "psp_okey";
/// Single column of the `existed` transitional table.
pub const PSP_EXISTED: &str = "psp_existed";
/// Sentinel column name requesting implicit-index behavior during ingestion.
pub const PSP_INDEX_SENTINEL: &str = "__INDEX__";

fn is_reserved(name: &str) -> bool {
    matches!(name, PSP_PKEY | PSP_OP | PSP_OKEY)
}

/// An ordered list of `(name, dtype)` pairs with O(1) name lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<(String, Dtype)>,
    by_name: HashMap<String, usize>,
}

impl Schema {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = (S, Dtype)>,
        S: Into<String>,
    {
        let columns: Vec<(String, Dtype)> =
            columns.into_iter().map(|(n, d)| (n.into(), d)).collect();
        let by_name = columns
            .iter()
            .enumerate()
            .map(|(idx, (n, _))| (n.clone(), idx))
            .collect();
        Schema { columns, by_name }
    }

    /// Input schema for a table keyed by a `pkey_dtype` primary key:
    /// `psp_pkey`, `psp_op`, then the output columns.
    pub fn pkeyed(pkey_dtype: Dtype, output: &Schema) -> Schema {
        let mut columns = vec![
            (PSP_PKEY.to_string(), pkey_dtype),
            (PSP_OP.to_string(), Dtype::U8),
        ];
        columns.extend(output.columns.iter().cloned());
        Schema::new(columns)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Dtype)> {
        self.columns.iter().map(|(n, d)| (n.as_str(), *d))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn dtype_of(&self, name: &str) -> Option<Dtype> {
        self.position(name).map(|idx| self.columns[idx].1)
    }

    pub fn column_at(&self, idx: usize) -> (&str, Dtype) {
        let (n, d) = &self.columns[idx];
        (n, *d)
    }

    pub fn add_column(&mut self, name: &str, dtype: Dtype) {
        if let Some(idx) = self.position(name) {
            self.columns[idx].1 = dtype;
            return;
        }
        self.by_name.insert(name.to_string(), self.columns.len());
        self.columns.push((name.to_string(), dtype));
    }

    pub fn remove_column(&mut self, name: &str) -> bool {
        let Some(idx) = self.position(name) else {
            return false;
        };
        self.columns.remove(idx);
        self.by_name.remove(name);
        for (n, i) in self.by_name.iter_mut() {
            if *i > idx {
                *i -= 1;
            }
            debug_assert_ne!(n.as_str(), name);
        }
        true
    }

    /// Retype an existing column; used by column promotion.
    pub fn retype_column(&mut self, name: &str, dtype: Dtype) -> bool {
        match self.position(name) {
            Some(idx) => {
                self.columns[idx].1 = dtype;
                true
            }
            None => false,
        }
    }

    /// The user-visible schema: every column except the reserved ones.
    pub fn drop_reserved(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .filter(|(n, _)| !is_reserved(n))
                .cloned()
                .collect::<Vec<_>>(),
        )
    }

    /// Check that `other` names exactly the same columns with the same
    /// dtypes; column order is not significant.
    pub fn check_matches(&self, other: &Schema) -> Result<(), SchemaError> {
        if self.len() != other.len() {
            return Err(SchemaError::ArityMismatch {
                expected: self.len(),
                found: other.len(),
            });
        }
        for (name, dtype) in other.iter() {
            match self.dtype_of(name) {
                None => return Err(SchemaError::UnknownColumn(name.to_string())),
                Some(expected) if expected != dtype => {
                    return Err(SchemaError::ColumnTypeMismatch {
                        column: name.to_string(),
                        expected,
                        found: dtype,
                    })
                }
                Some(_) => {}
            }
        }
        for name in self.names() {
            if !other.contains(name) {
                return Err(SchemaError::MissingColumn(name.to_string()));
            }
        }
        Ok(())
    }
}
