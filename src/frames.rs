use std::{cmp::Ordering, collections::HashMap};

use smallvec::SmallVec;

use crate::strings::StringIndex;

/// A resolved source location: function name, file, and line.
///
/// The file index may be zero (unknown file) and line zero means the
/// line is unknown.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Frame {
  pub function: StringIndex,
  pub file: StringIndex,
  pub line: u32,
}

/// Frames produced by inlined code, attached to their enclosing
/// instruction pointer.
pub type InlinedFrames = SmallVec<[Frame; 2]>;

/// Index of an interned instruction pointer record; zero means "none".
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct IpIndex(pub u32);

impl IpIndex {
  #[must_use]
  pub fn is_valid(self) -> bool {
    self.0 != 0
  }
}

impl nohash_hasher::IsEnabled for IpIndex {}

/// A code address together with its resolved primary frame, any inlined
/// frames, and the module it belongs to.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct InstructionPointer {
  pub address: u64,
  pub module: StringIndex,
  pub frame: Frame,
  pub inlined: InlinedFrames,
}

impl Default for InstructionPointer {
  fn default() -> Self {
    Self {
      address: 0,
      module: StringIndex::default(),
      frame: Frame::default(),
      inlined: InlinedFrames::new(),
    }
  }
}

impl InstructionPointer {
  /// Total order over `(primary frame, inlined frames, module)` that
  /// ignores the numeric address.
  ///
  /// Without debug symbols the same function often allocates at many
  /// distinct addresses; reports group such records into one entry.
  #[must_use]
  pub fn cmp_without_address(&self, other: &Self) -> Ordering {
    self
      .frame
      .cmp(&other.frame)
      .then_with(|| self.inlined.cmp(&other.inlined))
      .then_with(|| self.module.cmp(&other.module))
  }

  #[must_use]
  pub fn eq_without_address(&self, other: &Self) -> bool {
    self.cmp_without_address(other) == Ordering::Equal
  }
}

/// Owns every interned instruction pointer record.
#[derive(Debug, Default)]
pub struct IpTable {
  by_value: HashMap<InstructionPointer, IpIndex>,
  records: Vec<InstructionPointer>,
}

impl IpTable {
  /// Intern a record by full structural equality, address included.
  pub fn intern(&mut self, record: InstructionPointer) -> IpIndex {
    if let Some(existing) = self.by_value.get(&record) {
      return *existing;
    }

    self.records.push(record.clone());

    let index = IpIndex(u32::try_from(self.records.len()).unwrap_or(0));
    self.by_value.insert(record, index);

    index
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  /// Iterate all records with their indices, in insertion order.
  pub fn iter(&self) -> impl Iterator<Item = (IpIndex, &InstructionPointer)> {
    self
      .records
      .iter()
      .enumerate()
      .map(|(position, record)| (IpIndex(position as u32 + 1), record))
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.records.len()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Resolve an index to its record; the reserved zero index and
  /// out-of-range indices resolve to an empty record.
  #[must_use]
  pub fn resolve(&self, index: IpIndex) -> &InstructionPointer {
    static EMPTY: InstructionPointer = InstructionPointer {
      address: 0,
      module: StringIndex(0),
      frame: Frame {
        function: StringIndex(0),
        file: StringIndex(0),
        line: 0,
      },
      inlined: InlinedFrames::new_const(),
    };

    if !index.is_valid() {
      return &EMPTY;
    }

    self.records.get(index.0 as usize - 1).unwrap_or(&EMPTY)
  }
}
