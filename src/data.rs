use std::{
  collections::{HashMap, HashSet},
  fmt::{self, Display, Formatter},
  str::FromStr,
};

use nohash_hasher::BuildNoHashHasher;
use tracing::warn;

use crate::{
  event::{AllocationInfo, AllocationInfoIndex},
  frames::{Frame, InstructionPointer, IpIndex, IpTable},
  strings::{StringIndex, StringInterner},
  traces::{TraceIndex, TraceNode, TraceTable},
};

/// Selects one of the four cost dimensions of an allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CostType {
  Allocations,
  Temporary,
  Leaked,
  Peak,
}

impl Display for CostType {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Allocations => "allocations",
      Self::Temporary => "temporary",
      Self::Leaked => "leaked",
      Self::Peak => "peak",
    };
    f.write_str(name)
  }
}

impl FromStr for CostType {
  type Err = String;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value {
      "allocations" => Ok(Self::Allocations),
      "temporary" => Ok(Self::Temporary),
      "leaked" => Ok(Self::Leaked),
      "peak" => Ok(Self::Peak),
      other => Err(format!(
        "unknown cost type {other:?}, expected one of \
         allocations, temporary, leaked, peak"
      )),
    }
  }
}

/// Cost counters accumulated per call site and for the run as a whole.
///
/// Fields are signed so that subtracting one run from another can
/// represent negative deltas.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocationData {
  pub allocations: i64,
  pub temporary: i64,
  pub leaked: i64,
  pub peak: i64,
}

impl AllocationData {
  pub fn add(&mut self, other: &AllocationData) {
    self.allocations += other.allocations;
    self.temporary += other.temporary;
    self.leaked += other.leaked;
    self.peak += other.peak;
  }

  /// Project the counter selected by `cost`.
  #[must_use]
  pub fn cost(&self, cost: CostType) -> i64 {
    match cost {
      CostType::Allocations => self.allocations,
      CostType::Temporary => self.temporary,
      CostType::Leaked => self.leaked,
      CostType::Peak => self.peak,
    }
  }

  pub fn sub(&mut self, other: &AllocationData) {
    self.allocations -= other.allocations;
    self.temporary -= other.temporary;
    self.leaked -= other.leaked;
    self.peak -= other.peak;
  }
}

/// Running counters for one call site, keyed by its trace.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Allocation {
  pub trace_index: TraceIndex,
  pub data: AllocationData,
}

/// System information reported by the recorder.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SystemInfo {
  pub page_size: u64,
  pub pages: u64,
}

/// Aggregated contents of one trace file.
///
/// Interners and tables grow monotonically while the reader fires
/// events; allocations hold only indices into the tables, never
/// pointers, so the aggregate stays cheap to copy around.
#[derive(Debug, Default)]
pub struct TraceData {
  /// Per call site counters, sorted by trace index.
  pub allocations: Vec<Allocation>,
  pub allocation_infos: Vec<AllocationInfo>,
  pub debuggee: String,
  pub embedded_suppressions: Vec<String>,
  pub ips: IpTable,
  pub peak_rss_pages: i64,
  pub strings: StringInterner,
  pub system: SystemInfo,
  pub total_cost: AllocationData,
  pub total_time: i64,
  pub traces: TraceTable,
  last_allocation: Option<AllocationInfoIndex>,
}

impl TraceData {
  /// Apply one allocation event to the call site and the run totals.
  ///
  /// The per site peak is the maximum of its own outstanding bytes;
  /// the run-wide peak tracks the true maximum of the whole heap.
  pub fn add_allocation(
    &mut self,
    info: AllocationInfo,
    index: AllocationInfoIndex,
  ) {
    let size = info.size as i64;

    let allocation = self.allocation_mut(info.trace_index);
    allocation.data.allocations += 1;
    allocation.data.leaked += size;
    if allocation.data.leaked > allocation.data.peak {
      allocation.data.peak = allocation.data.leaked;
    }

    self.total_cost.allocations += 1;
    self.total_cost.leaked += size;
    if self.total_cost.leaked > self.total_cost.peak {
      self.total_cost.peak = self.total_cost.leaked;
    }

    self.last_allocation = Some(index);
  }

  /// Apply one deallocation event.
  ///
  /// A deallocation is temporary when it frees the most recent
  /// allocation and no allocation happened in between; intervening
  /// frees do not disqualify it.
  pub fn add_deallocation(
    &mut self,
    info: AllocationInfo,
    index: AllocationInfoIndex,
  ) {
    let size = info.size as i64;
    let temporary = self.last_allocation == Some(index);

    let allocation = self.allocation_mut(info.trace_index);
    allocation.data.leaked -= size;
    if temporary {
      allocation.data.temporary += 1;
    }

    self.total_cost.leaked -= size;
    if temporary {
      self.total_cost.temporary += 1;
      self.last_allocation = None;
    }
  }

  fn allocation_mut(&mut self, trace_index: TraceIndex) -> &mut Allocation {
    let position = self
      .allocations
      .binary_search_by_key(&trace_index, |allocation| allocation.trace_index);

    match position {
      Ok(found) => &mut self.allocations[found],
      Err(insert_at) => {
        self.allocations.insert(
          insert_at,
          Allocation {
            trace_index,
            ..Allocation::default()
          },
        );
        &mut self.allocations[insert_at]
      }
    }
  }

  /// Subtract another run's costs, matching traces across files by
  /// their walked instruction pointer chains compared without
  /// addresses. Identities missing on this side are interned, so
  /// entries unique to `base` show up as negative deltas.
  pub fn diff(&mut self, base: &TraceData) {
    self.total_cost.sub(&base.total_cost);
    self.total_time -= base.total_time;
    self.peak_rss_pages -= base.peak_rss_pages;

    let mut by_chain: HashMap<Vec<LocationKey>, TraceIndex> = HashMap::new();
    for allocation in &self.allocations {
      by_chain
        .entry(self.trace_key(allocation.trace_index))
        .or_insert(allocation.trace_index);
    }

    let mut by_location: HashMap<LocationKey, IpIndex> = HashMap::new();
    for (index, record) in self.ips.iter() {
      by_location
        .entry(LocationKey::new(&self.strings, record))
        .or_insert(index);
    }

    let mut ip_map: HashMap<u32, IpIndex, BuildNoHashHasher<u32>> =
      HashMap::default();
    let mut trace_map: HashMap<u32, TraceIndex, BuildNoHashHasher<u32>> =
      HashMap::default();

    for allocation in &base.allocations {
      let trace_index = match trace_map.get(&allocation.trace_index.0) {
        Some(mapped) => *mapped,
        None => {
          let key = base.trace_key(allocation.trace_index);
          let mapped = match by_chain.get(&key) {
            Some(existing) => *existing,
            None => {
              // A chain this run never produced; carry it over.
              let created = self.remap_trace(
                base,
                allocation.trace_index,
                &mut by_location,
                &mut ip_map,
              );
              by_chain.insert(key, created);
              created
            }
          };
          trace_map.insert(allocation.trace_index.0, mapped);
          mapped
        }
      };
      self.allocation_mut(trace_index).data.sub(&allocation.data);
    }
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  fn remap_frame(&mut self, base: &TraceData, frame: Frame) -> Frame {
    Frame {
      function: self.remap_string(base, frame.function),
      file: self.remap_string(base, frame.file),
      line: frame.line,
    }
  }

  fn remap_ip(
    &mut self,
    base: &TraceData,
    base_ip: IpIndex,
    by_location: &mut HashMap<LocationKey, IpIndex>,
    ip_map: &mut HashMap<u32, IpIndex, BuildNoHashHasher<u32>>,
  ) -> IpIndex {
    if let Some(mapped) = ip_map.get(&base_ip.0) {
      return *mapped;
    }

    let record = base.ips.resolve(base_ip).clone();
    let key = LocationKey::new(&base.strings, &record);

    let mapped = match by_location.get(&key) {
      Some(existing) => *existing,
      None => {
        let carried = InstructionPointer {
          address: record.address,
          module: self.remap_string(base, record.module),
          frame: self.remap_frame(base, record.frame),
          inlined: record
            .inlined
            .iter()
            .map(|frame| self.remap_frame(base, *frame))
            .collect(),
        };
        let interned = self.ips.intern(carried);
        by_location.insert(key, interned);
        interned
      }
    };

    ip_map.insert(base_ip.0, mapped);

    mapped
  }

  fn remap_string(
    &mut self,
    base: &TraceData,
    index: StringIndex,
  ) -> StringIndex {
    if !index.is_valid() {
      return StringIndex::default();
    }

    self.strings.intern(base.strings.resolve(index))
  }

  fn remap_trace(
    &mut self,
    base: &TraceData,
    base_trace: TraceIndex,
    by_location: &mut HashMap<LocationKey, IpIndex>,
    ip_map: &mut HashMap<u32, IpIndex, BuildNoHashHasher<u32>>,
  ) -> TraceIndex {
    if !base_trace.is_valid() {
      return TraceIndex::default();
    }

    let chain: Vec<IpIndex> = base.walk(base_trace).collect();

    let mut mapped = TraceIndex::default();
    for base_ip in chain.iter().rev() {
      let self_ip = self.remap_ip(base, *base_ip, by_location, ip_map);
      mapped = self.traces.intern(self_ip, mapped);
    }

    mapped
  }

  /// Freeze the run time once the event stream ends.
  pub fn set_total_time(&mut self, total_time: i64) {
    self.total_time = total_time;
  }

  /// Address-less identity of a trace's walked location chain.
  fn trace_key(&self, trace_index: TraceIndex) -> Vec<LocationKey> {
    self
      .walk(trace_index)
      .map(|ip_index| {
        LocationKey::new(&self.strings, self.ips.resolve(ip_index))
      })
      .collect()
  }

  /// Leaf-to-root walk over a trace's instruction pointers.
  #[must_use]
  pub fn walk(&self, trace_index: TraceIndex) -> TraceWalk<'_> {
    TraceWalk {
      data: self,
      node: self.traces.resolve(trace_index),
      seen: HashSet::default(),
      stopped: false,
    }
  }
}

/// Owned rendering of an instruction pointer's source identity, used to
/// match records across two independently interned files.
#[derive(Debug, Eq, Hash, PartialEq)]
struct LocationKey {
  frames: Vec<(String, String, u32)>,
  module: String,
}

impl LocationKey {
  fn new(strings: &StringInterner, record: &InstructionPointer) -> Self {
    let mut frames = Vec::with_capacity(1 + record.inlined.len());
    frames.push(Self::frame_key(strings, record.frame));
    frames.extend(
      record
        .inlined
        .iter()
        .map(|frame| Self::frame_key(strings, *frame)),
    );

    Self {
      frames,
      module: strings.resolve(record.module).to_string(),
    }
  }

  fn frame_key(
    strings: &StringInterner,
    frame: Frame,
  ) -> (String, String, u32) {
    (
      strings.resolve(frame.function).to_string(),
      strings.resolve(frame.file).to_string(),
      frame.line,
    )
  }
}

/// Leaf-to-root iterator over a trace's instruction pointers.
///
/// The walk terminates after yielding a stop function and guards
/// against parent cycles, emitting one diagnostic per corrupted trace.
pub struct TraceWalk<'a> {
  data: &'a TraceData,
  node: TraceNode,
  seen: HashSet<u32, BuildNoHashHasher<u32>>,
  stopped: bool,
}

impl Iterator for TraceWalk<'_> {
  type Item = IpIndex;

  fn next(&mut self) -> Option<IpIndex> {
    if self.stopped || !self.node.ip_index.is_valid() {
      return None;
    }

    let ip_index = self.node.ip_index;
    let record = self.data.ips.resolve(ip_index);

    if self.data.strings.is_stop_index(record.frame.function) {
      self.stopped = true;
    } else if self.seen.insert(self.node.parent_index.0) {
      self.node = self.data.traces.resolve(self.node.parent_index);
    } else {
      warn!(
        trace = self.node.parent_index.0,
        "trace recursion detected - corrupt data file?"
      );
      self.stopped = true;
    }

    Some(ip_index)
  }
}
