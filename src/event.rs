use crate::{data::TraceData, traces::TraceIndex};

/// Index of an allocation info record, dense in file order.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AllocationInfoIndex(pub u32);

impl nohash_hasher::IsEnabled for AllocationInfoIndex {}

/// Size and origin of one recorded allocation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocationInfo {
  pub size: u64,
  pub trace_index: TraceIndex,
}

/// Which pass over the data file is currently running.
///
/// Accumulation happens on the first pass; the second pass lets
/// consumers re-walk the event stream after run totals are known.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsePass {
  First,
  Second,
}

/// Hooks through which the reader drives report consumers.
///
/// The reader fires these in strict file order and never re-enters a
/// handler. Callbacks cannot fail; consumers latch their own output
/// errors internally.
pub trait EventHandler {
  /// One allocation event was applied to the aggregate.
  fn handle_allocation(
    &mut self,
    _data: &TraceData,
    _info: AllocationInfo,
    _index: AllocationInfoIndex,
  ) {
  }

  /// The profiled command line became known.
  fn handle_debuggee(&mut self, _command: &str) {}

  /// Time advanced; `is_final` marks the end of the event stream.
  fn handle_time_stamp(
    &mut self,
    _data: &TraceData,
    _old_stamp: i64,
    _new_stamp: i64,
    _is_final: bool,
    _pass: ParsePass,
  ) {
  }
}

/// Handler for runs that only need the aggregate.
impl EventHandler for () {}
