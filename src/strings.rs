use std::collections::HashMap;

/// Function names whose presence terminates upward trace walks.
pub const STOP_FUNCTIONS: [&str; 3] = [
  "main",
  "__libc_start_main",
  "__static_initialization_and_destruction_0",
];

/// Index of an interned string; zero is reserved for "no string".
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StringIndex(pub u32);

impl StringIndex {
  #[must_use]
  pub fn is_valid(self) -> bool {
    self.0 != 0
  }
}

impl nohash_hasher::IsEnabled for StringIndex {}

/// Assigns small dense indices to distinct strings.
///
/// Indices are handed out in first-seen order and stay stable for the
/// whole run; nothing is ever removed.
#[derive(Debug, Default)]
pub struct StringInterner {
  by_value: HashMap<String, StringIndex>,
  stop_indices: Vec<StringIndex>,
  values: Vec<String>,
}

impl StringInterner {
  /// Intern `value` and return its stable index.
  pub fn intern(&mut self, value: &str) -> StringIndex {
    if let Some(existing) = self.by_value.get(value) {
      return *existing;
    }

    self.values.push(value.to_string());

    let index = StringIndex(u32::try_from(self.values.len()).unwrap_or(0));
    self.by_value.insert(value.to_string(), index);

    if STOP_FUNCTIONS.contains(&value) {
      self.stop_indices.push(index);
    }

    index
  }

  /// Whether `index` names a function that terminates trace walks.
  #[must_use]
  pub fn is_stop_index(&self, index: StringIndex) -> bool {
    self.stop_indices.contains(&index)
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.values.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Resolve an index back to its string; the reserved zero index and
  /// out-of-range indices resolve to the empty string.
  #[must_use]
  pub fn resolve(&self, index: StringIndex) -> &str {
    if !index.is_valid() {
      return "";
    }

    self
      .values
      .get(index.0 as usize - 1)
      .map_or("", String::as_str)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn interns_and_reuses_indices() {
    let mut interner = StringInterner::new();
    let first = interner.intern("malloc");
    let second = interner.intern("malloc");
    assert_eq!(first, second);
    assert_eq!(interner.len(), 1);
    assert_eq!(interner.resolve(first), "malloc");
  }

  #[test]
  fn zero_resolves_to_nothing() {
    let interner = StringInterner::new();
    assert_eq!(interner.resolve(StringIndex::default()), "");
    assert!(!StringIndex::default().is_valid());
  }

  #[test]
  fn recognizes_stop_functions() {
    let mut interner = StringInterner::new();
    let main = interner.intern("main");
    let other = interner.intern("allocate_something");
    assert!(interner.is_stop_index(main));
    assert!(!interner.is_stop_index(other));
  }
}
