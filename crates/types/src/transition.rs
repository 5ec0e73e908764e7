/// Per-cell transition code describing how a cell changed between the master
/// state and the incoming batch.
///
/// The 8-bit encoding is a wire contract with contexts and must not change.
/// The naming scheme reads as `EQ`/`NEQ` for value equality, followed by the
/// validity of the previous and current value (`F`/`T`), with a `D` marking
/// the intra-batch delete cases and `NV` the invalid-to-valid transition on a
/// row that already existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Transition {
    /// Neither the previous nor the current cell existed.
    EqFf = 0,
    /// Previous and current both exist and are equal.
    EqTt = 1,
    /// The row (or cell) newly appears.
    NeqFt = 2,
    /// The row disappears.
    NeqTf = 3,
    /// The row persists and the cell value changed.
    NeqTt = 4,
    /// Re-insert after a delete of the same key earlier in the batch.
    NeqTdt = 5,
    /// The row is deleted.
    NeqTdf = 6,
    /// The row already existed but the cell became valid.
    NveqFt = 7,
}

impl Transition {
    pub fn from_u8(value: u8) -> Option<Transition> {
        Some(match value {
            0 => Transition::EqFf,
            1 => Transition::EqTt,
            2 => Transition::NeqFt,
            3 => Transition::NeqTf,
            4 => Transition::NeqTt,
            5 => Transition::NeqTdt,
            6 => Transition::NeqTdf,
            7 => Transition::NveqFt,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
