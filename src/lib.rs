//! Batch analyzer for recorded heap allocation traces.
//!
//! The crate aggregates the allocation and deallocation events of a
//! profiled program by call stack, merges call sites that differ only
//! by instruction address, applies leak suppressions, and renders
//! top-N cost reports, allocation size histograms, folded-stack
//! flamegraph files, and massif-compatible heap snapshots.

mod config;
mod data;
mod error;
mod event;
mod frames;
mod massif;
mod merge;
mod reader;
mod report;
mod strings;
mod suppressions;
mod traces;

use {
  std::io::{self, Write},
  tracing::error,
};

pub use {
  config::ReportOptions,
  data::{
    Allocation, AllocationData, CostType, SystemInfo, TraceData, TraceWalk,
  },
  error::AnalyzeError,
  event::{AllocationInfo, AllocationInfoIndex, EventHandler, ParsePass},
  frames::{Frame, InlinedFrames, InstructionPointer, IpIndex, IpTable},
  massif::MassifWriter,
  merge::{MergedAllocation, filter_allocations, merge_allocations},
  reader::Reader,
  report::{
    FormatBytes, pretty_function, print_merged, print_summary,
    print_unmerged, write_flamegraph, write_histogram,
  },
  strings::{STOP_FUNCTIONS, StringIndex, StringInterner},
  suppressions::{
    Suppression, SuppressionOptions, apply_leak_suppressions,
    build_suppressions, parse_suppressions_file,
  },
  traces::{TraceIndex, TraceNode, TraceTable},
};
