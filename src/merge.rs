use crate::data::{Allocation, AllocationData, TraceData};
use crate::frames::IpIndex;

/// Allocations reached through numerically distinct instruction
/// pointers of one source location, merged into a single entry.
#[derive(Clone, Debug, Default)]
pub struct MergedAllocation {
  pub data: AllocationData,
  pub ip_index: IpIndex,
  pub traces: Vec<Allocation>,
}

/// Drop allocations whose backtrace never passes through a function
/// containing `pattern`, checking primary and inlined frames on the
/// walk from the leaf towards the root.
pub fn filter_allocations(data: &mut TraceData, pattern: &str) {
  if pattern.is_empty() {
    return;
  }

  let mut allocations = std::mem::take(&mut data.allocations);

  allocations.retain(|allocation| {
    data.walk(allocation.trace_index).any(|ip_index| {
      let record = data.ips.resolve(ip_index);
      let matches = |function| {
        data.strings.resolve(function).contains(pattern)
      };
      matches(record.frame.function)
        || record.inlined.iter().any(|frame| matches(frame.function))
    })
  });

  data.allocations = allocations;
}

/// Group allocations by the call site that invoked the allocation
/// function, ignoring instruction pointer addresses.
///
/// Traces that only share a deeper prefix stay separate: the grouping
/// key is the final instruction pointer of each trace. The result is
/// ordered by the address-less comparator so lookups during insertion
/// stay logarithmic; totals are the sums over each group.
#[must_use]
pub fn merge_allocations(
  data: &TraceData,
  allocations: &[Allocation],
) -> Vec<MergedAllocation> {
  let mut merged: Vec<MergedAllocation> = Vec::new();

  for allocation in allocations {
    let node = data.traces.resolve(allocation.trace_index);
    let record = data.ips.resolve(node.ip_index);

    let position = merged.binary_search_by(|candidate| {
      data
        .ips
        .resolve(candidate.ip_index)
        .cmp_without_address(record)
    });

    match position {
      Ok(found) => merged[found].traces.push(*allocation),
      Err(insert_at) => merged.insert(
        insert_at,
        MergedAllocation {
          data: AllocationData::default(),
          ip_index: node.ip_index,
          traces: vec![*allocation],
        },
      ),
    }
  }

  for group in &mut merged {
    let mut total = AllocationData::default();
    for trace in &group.traces {
      total.add(&trace.data);
    }
    group.data = total;
  }

  merged
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data::testing::sample_data;

  #[test]
  fn merges_call_sites_that_differ_only_by_address() {
    let data = sample_data();
    let merged = merge_allocations(&data, &data.allocations);

    // Both helper addresses collapse into one entry.
    assert_eq!(merged.len(), 1);

    let group = &merged[0];
    assert_eq!(group.traces.len(), 2);
    assert_eq!(group.data.allocations, 5);
    assert_eq!(group.data.peak, 175);
    assert_eq!(group.data.leaked, 0);
    assert_eq!(group.data.temporary, 2);
  }

  #[test]
  fn totals_equal_the_sum_of_their_traces() {
    let data = sample_data();

    for group in merge_allocations(&data, &data.allocations) {
      let mut expected = AllocationData::default();
      for trace in &group.traces {
        expected.add(&trace.data);
      }
      assert_eq!(group.data, expected);
    }
  }

  #[test]
  fn empty_traces_group_under_the_empty_location() {
    let mut data = sample_data();
    let stray = Allocation::default();
    data.allocations.insert(0, stray);

    let merged = merge_allocations(&data, &data.allocations);
    assert_eq!(merged.len(), 2);
    assert!(merged
      .iter()
      .any(|group| !group.ip_index.is_valid()));
  }

  #[test]
  fn filter_keeps_only_matching_backtraces() {
    let mut data = sample_data();
    filter_allocations(&mut data, "bar");

    assert_eq!(data.allocations.len(), 1);
    assert_eq!(data.allocations[0].data.allocations, 3);

    let mut all = sample_data();
    filter_allocations(&mut all, "allocate");
    assert_eq!(all.allocations.len(), 2);

    let mut none = sample_data();
    filter_allocations(&mut none, "no_such_function");
    assert!(none.allocations.is_empty());
  }

  #[test]
  fn empty_filter_is_a_noop() {
    let mut data = sample_data();
    filter_allocations(&mut data, "");
    assert_eq!(data.allocations.len(), 2);
  }
}
