use std::collections::HashMap;

use nohash_hasher::BuildNoHashHasher;

use crate::frames::IpIndex;

/// Index of a backtrace node; zero is reserved for "no trace".
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TraceIndex(pub u32);

impl TraceIndex {
  #[must_use]
  pub fn is_valid(self) -> bool {
    self.0 != 0
  }
}

impl nohash_hasher::IsEnabled for TraceIndex {}

/// One parent-linked backtrace node; the leaf is the innermost call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TraceNode {
  pub ip_index: IpIndex,
  pub parent_index: TraceIndex,
}

/// Parent-linked forest of backtrace nodes, stored as a dense table.
///
/// Nodes hold indices rather than pointers, so traces are trivially
/// copyable and ownership stays with the table.
#[derive(Debug, Default)]
pub struct TraceTable {
  by_value: HashMap<u64, TraceIndex, BuildNoHashHasher<u64>>,
  nodes: Vec<TraceNode>,
}

impl TraceTable {
  /// Intern a `(ip, parent)` node and return its stable index.
  pub fn intern(
    &mut self,
    ip_index: IpIndex,
    parent_index: TraceIndex,
  ) -> TraceIndex {
    let key = Self::key(ip_index, parent_index);

    if let Some(existing) = self.by_value.get(&key) {
      return *existing;
    }

    self.nodes.push(TraceNode {
      ip_index,
      parent_index,
    });

    let index = TraceIndex(u32::try_from(self.nodes.len()).unwrap_or(0));
    self.by_value.insert(key, index);

    index
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  fn key(ip_index: IpIndex, parent_index: TraceIndex) -> u64 {
    (u64::from(ip_index.0) << 32) | u64::from(parent_index.0)
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Resolve an index to its node; the reserved zero index and
  /// out-of-range indices resolve to a node without an instruction
  /// pointer.
  #[must_use]
  pub fn resolve(&self, index: TraceIndex) -> TraceNode {
    if !index.is_valid() {
      return TraceNode::default();
    }

    self
      .nodes
      .get(index.0 as usize - 1)
      .copied()
      .unwrap_or_default()
  }
}
