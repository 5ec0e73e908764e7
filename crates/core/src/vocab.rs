use indexmap::IndexMap;

/// Per-column string dictionary.
///
/// Ids are dense and assigned in interning order; id 0 is always the empty
/// string so freshly zeroed slots resolve to something sensible. Columns share
/// a vocabulary through `Arc<Vocab>`: when two columns hold the same `Arc`,
/// string equality reduces to id equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocab {
    entries: IndexMap<Box<str>, ()>,
}

impl Vocab {
    pub fn new() -> Self {
        let mut entries = IndexMap::new();
        entries.insert("".into(), ());
        Vocab { entries }
    }

    /// Intern `s`, returning its id. Re-interning returns the existing id.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(idx) = self.entries.get_index_of(s) {
            return idx as u32;
        }
        let (idx, _) = self.entries.insert_full(s.into(), ());
        idx as u32
    }

    /// Id for `s` if it is already interned.
    pub fn id_of(&self, s: &str) -> Option<u32> {
        self.entries.get_index_of(s).map(|idx| idx as u32)
    }

    pub fn resolve(&self, id: u32) -> &str {
        self.entries
            .get_index(id as usize)
            .map(|(s, ())| &**s)
            .unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        // The empty string is always present.
        self.entries.len() <= 1
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Vocab::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_string_is_id_zero() {
        let mut v = Vocab::new();
        assert_eq!(v.intern(""), 0);
        assert_eq!(v.resolve(0), "");
    }

    #[test]
    fn interning_is_idempotent() {
        let mut v = Vocab::new();
        let a = v.intern("alpha");
        let b = v.intern("beta");
        assert_ne!(a, b);
        assert_eq!(v.intern("alpha"), a);
        assert_eq!(v.resolve(b), "beta");
        assert_eq!(v.id_of("beta"), Some(b));
        assert_eq!(v.id_of("gamma"), None);
    }
}
