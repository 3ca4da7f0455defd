use std::collections::BTreeMap;

use heapreport::{
  AllocationInfo, AllocationInfoIndex, CostType, EventHandler, Reader,
  ReportOptions, Suppression, SuppressionOptions, TraceData,
  apply_leak_suppressions, build_suppressions, merge_allocations,
  print_merged, print_summary, write_flamegraph, write_histogram,
};

mod support;

use support::{PEAK_TRACE, TraceFile};

/// Trace fixture with a single 100 byte allocation from
/// `main -> foo`, never freed.
const LEAK_TRACE: &str = "\
v 1
X ./leaky
s main
s foo
s app.c
s app
i 201 4 1 3 5
i 202 4 2 3 9
t 1 0
t 2 1
a 64 2
c 64
+ 0
";

fn read(content: &str) -> TraceData {
  let file = TraceFile::new("trace.dat", content);
  let reader = Reader::open(file.path()).expect("fixture should open");
  let mut data = TraceData::new();
  reader.read(&mut data, &mut ()).expect("fixture should parse");
  data
}

#[test]
fn peak_program_aggregates_and_merges_call_sites() {
  let data = read(PEAK_TRACE);

  assert_eq!(data.total_cost.allocations, 5);
  assert_eq!(data.total_cost.leaked, 0);
  assert_eq!(data.total_cost.peak, 125);

  let mut merged = merge_allocations(&data, &data.allocations);
  assert_eq!(merged.len(), 1);
  assert_eq!(merged[0].data.allocations, 5);
  assert_eq!(merged[0].data.peak, 175);

  let mut output = Vec::new();
  print_merged(
    &data,
    &mut merged,
    CostType::Allocations,
    &ReportOptions::default(),
    &mut output,
  )
  .expect("report should render");

  let output = String::from_utf8(output).expect("report is UTF-8");
  assert!(output.starts_with(
    "5 calls to allocation functions with 175B peak consumption from\n\
     allocate_something\n"
  ));
}

#[test]
fn a_leak_shows_up_in_the_leaks_report_and_histogram() {
  struct HistogramHandler {
    histogram: BTreeMap<u64, u64>,
  }

  impl EventHandler for HistogramHandler {
    fn handle_allocation(
      &mut self,
      _data: &TraceData,
      info: AllocationInfo,
      _index: AllocationInfoIndex,
    ) {
      *self.histogram.entry(info.size).or_insert(0) += 1;
    }
  }

  let file = TraceFile::new("leak.dat", LEAK_TRACE);
  let reader = Reader::open(file.path()).expect("fixture should open");
  let mut data = TraceData::new();
  let mut handler = HistogramHandler {
    histogram: BTreeMap::new(),
  };
  reader
    .read(&mut data, &mut handler)
    .expect("fixture should parse");

  assert_eq!(data.total_cost.leaked, 100);

  let mut merged = merge_allocations(&data, &data.allocations);
  let mut output = Vec::new();
  print_merged(
    &data,
    &mut merged,
    CostType::Leaked,
    &ReportOptions::default(),
    &mut output,
  )
  .expect("report should render");

  let output = String::from_utf8(output).expect("report is UTF-8");
  assert!(
    output.starts_with("100B leaked over 1 calls from\nfoo\n  at app.c:9\n")
  );

  let mut histogram = Vec::new();
  write_histogram(&handler.histogram, &mut histogram)
    .expect("histogram should render");
  assert_eq!(histogram, b"100\t1\n");
}

#[test]
fn flamegraph_of_a_leak_folds_the_stack_root_first() {
  let data = read(LEAK_TRACE);

  let mut output = Vec::new();
  write_flamegraph(
    &data,
    &data.allocations,
    CostType::Leaked,
    &ReportOptions::default(),
    &mut output,
  )
  .expect("flamegraph should render");

  assert_eq!(
    String::from_utf8(output).expect("flamegraph is UTF-8"),
    "main (app.c);foo (app.c); 100\n"
  );
}

#[test]
fn suppressions_divert_matching_leaks() {
  const TRACE: &str = "\
v 1
X ./supp
s main
s my_alloc
s other_alloc
s s.c
s s
i 301 5 1 4 3
i 302 5 2 4 7
i 303 5 3 4 b
t 1 0
t 2 1
t 3 1
a 40 2
a 30 3
+ 0
+ 1
";

  let mut data = read(TRACE);
  assert_eq!(data.total_cost.leaked, 0x40 + 0x30);

  let options = SuppressionOptions {
    disable_builtin: true,
    user_patterns: vec!["my_alloc".into()],
    ..SuppressionOptions::default()
  };
  let mut suppressions =
    build_suppressions(&options, &data.embedded_suppressions);
  let total_suppressed =
    apply_leak_suppressions(&mut data, &mut suppressions)
      .expect("bookkeeping should balance");

  assert_eq!(total_suppressed, 0x40);
  assert_eq!(suppressions[0].matches, 1);
  assert_eq!(suppressions[0].leaked, 0x40);
  assert_eq!(data.total_cost.leaked, 0x30);

  let mut merged = merge_allocations(&data, &data.allocations);
  let mut output = Vec::new();
  print_merged(
    &data,
    &mut merged,
    CostType::Leaked,
    &ReportOptions::default(),
    &mut output,
  )
  .expect("report should render");

  let output = String::from_utf8(output).expect("report is UTF-8");
  assert!(output.contains("other_alloc"));
  assert!(!output.contains("my_alloc"));
}

#[test]
fn diff_of_a_file_against_itself_is_empty() {
  let mut data = read(PEAK_TRACE);
  let base = read(PEAK_TRACE);

  data.diff(&base);

  let mut merged = merge_allocations(&data, &data.allocations);
  for cost in [
    CostType::Allocations,
    CostType::Peak,
    CostType::Leaked,
    CostType::Temporary,
  ] {
    let mut output = Vec::new();
    print_merged(
      &data,
      &mut merged,
      cost,
      &ReportOptions::default(),
      &mut output,
    )
    .expect("report should render");
    assert!(output.is_empty(), "{cost} report should be empty");
  }

  let mut flamegraph = Vec::new();
  write_flamegraph(
    &data,
    &data.allocations,
    CostType::Leaked,
    &ReportOptions::default(),
    &mut flamegraph,
  )
  .expect("flamegraph should render");
  let cost_sum: i64 = String::from_utf8(flamegraph)
    .expect("flamegraph is UTF-8")
    .lines()
    .map(|line| {
      line
        .rsplit(' ')
        .next()
        .and_then(|cost| cost.parse::<i64>().ok())
        .unwrap_or(0)
    })
    .sum();
  assert_eq!(cost_sum, 0);

  let mut summary = Vec::new();
  print_summary(&data, 0, &[], false, &mut summary)
    .expect("summary should render");
  let summary = String::from_utf8(summary).expect("summary is UTF-8");
  assert!(summary.contains("total runtime: 0.00s."));
  assert!(summary.contains("calls to allocation functions: 0 (0/s)"));
  assert!(summary.contains("total memory leaked: 0B"));
}

#[test]
fn embedded_suppressions_are_picked_up_from_the_file() {
  const TRACE: &str = "\
v 1
X ./embedded
S leak:my_alloc
s main
s my_alloc
s s.c
s s
i 301 4 1 3 3
i 302 4 2 3 7
t 1 0
t 2 1
a 40 2
+ 0
";

  let mut data = read(TRACE);
  assert_eq!(data.embedded_suppressions, ["leak:my_alloc"]);

  let options = SuppressionOptions {
    disable_builtin: true,
    ..SuppressionOptions::default()
  };
  let mut suppressions =
    build_suppressions(&options, &data.embedded_suppressions);
  assert_eq!(suppressions, vec![Suppression::new("my_alloc")]);

  let total_suppressed =
    apply_leak_suppressions(&mut data, &mut suppressions)
      .expect("bookkeeping should balance");
  assert_eq!(total_suppressed, 0x40);
  assert_eq!(data.total_cost.leaked, 0);
}
