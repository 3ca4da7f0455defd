use std::{
  borrow::Cow,
  cmp::Reverse,
  collections::BTreeMap,
  fmt::{self, Display, Formatter},
  io::{self, Write},
};

use crate::{
  config::ReportOptions,
  data::{Allocation, AllocationData, CostType, TraceData},
  frames::{InstructionPointer, IpIndex},
  merge::MergedAllocation,
  suppressions::Suppression,
  traces::TraceIndex,
};

/// Human readable byte quantity, optionally right-aligned to a width.
///
/// Quantities step through B/KB/MB/GB/TB in decimal and print two
/// decimals once scaled; plain byte counts stay integral.
pub struct FormatBytes {
  bytes: i64,
  width: usize,
}

impl FormatBytes {
  #[must_use]
  pub fn new(bytes: i64) -> Self {
    Self { bytes, width: 0 }
  }

  #[must_use]
  pub fn padded(bytes: i64, width: usize) -> Self {
    Self { bytes, width }
  }
}

impl Display for FormatBytes {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = self.bytes as f64;
    let mut unit = 0;
    while unit < UNITS.len() - 1 && value.abs() > 1000.0 {
      value /= 1000.0;
      unit += 1;
    }

    let rendered = if unit == 0 {
      self.bytes.to_string()
    } else {
      format!("{value:.2}")
    };

    let suffix = UNITS[unit];
    if self.width > suffix.len() {
      let width = self.width - suffix.len();
      write!(f, "{rendered:>width$}{suffix}")
    } else {
      write!(f, "{rendered}{suffix}")
    }
  }
}

/// Collapse template argument lists when shortening is enabled.
#[must_use]
pub fn pretty_function(name: &str, shorten: bool) -> Cow<'_, str> {
  if !shorten || !name.contains('<') {
    return Cow::Borrowed(name);
  }

  let mut output = String::with_capacity(name.len());
  let mut depth = 0usize;

  for character in name.chars() {
    match character {
      '<' => {
        depth += 1;
        if depth == 1 {
          output.push('<');
        }
      }
      '>' => {
        depth = depth.saturating_sub(1);
        if depth == 0 {
          output.push('>');
        }
      }
      _ if depth == 0 => output.push(character),
      _ => {}
    }
  }

  Cow::Owned(output)
}

fn write_indent<W: Write>(out: &mut W, indent: usize) -> io::Result<()> {
  for _ in 0..indent {
    out.write_all(b"  ")?;
  }
  Ok(())
}

fn write_ip<W: Write>(
  data: &TraceData,
  record: &InstructionPointer,
  options: &ReportOptions,
  indent: usize,
  out: &mut W,
) -> io::Result<()> {
  write_indent(out, indent)?;

  if record.frame.function.is_valid() {
    let function = data.strings.resolve(record.frame.function);
    write!(out, "{}", pretty_function(function, options.shorten_templates))?;
  } else {
    write!(out, "0x{:x}", record.address)?;
  }
  writeln!(out)?;

  write_indent(out, indent + 1)?;
  if record.frame.file.is_valid() {
    writeln!(
      out,
      "at {}:{}",
      data.strings.resolve(record.frame.file),
      record.frame.line
    )?;
    write_indent(out, indent + 1)?;
  }

  if record.module.is_valid() {
    writeln!(out, "in {}", data.strings.resolve(record.module))?;
  } else {
    writeln!(out, "in ??")?;
  }

  for frame in &record.inlined {
    write_indent(out, indent)?;
    let function = data.strings.resolve(frame.function);
    writeln!(
      out,
      "{}",
      pretty_function(function, options.shorten_templates)
    )?;
    write_indent(out, indent + 1)?;
    writeln!(
      out,
      "at {}:{}",
      data.strings.resolve(frame.file),
      frame.line
    )?;
  }

  Ok(())
}

fn write_backtrace<W: Write>(
  data: &TraceData,
  trace_index: TraceIndex,
  options: &ReportOptions,
  indent: usize,
  skip_first: bool,
  out: &mut W,
) -> io::Result<()> {
  if !trace_index.is_valid() {
    return write!(out, "  ??");
  }

  let mut skip = skip_first;
  for ip_index in data.walk(trace_index) {
    if skip {
      skip = false;
      continue;
    }
    write_ip(data, data.ips.resolve(ip_index), options, indent, out)?;
  }

  Ok(())
}

fn write_label<W: Write>(
  out: &mut W,
  cost: CostType,
  data: &AllocationData,
  sub_entry: bool,
) -> io::Result<()> {
  let colon = if sub_entry { ":" } else { "" };

  match cost {
    CostType::Allocations => {
      let detail = if sub_entry {
        "calls with"
      } else {
        "calls to allocation functions with"
      };
      writeln!(
        out,
        "{} {detail} {} peak consumption from{colon}",
        data.allocations,
        FormatBytes::new(data.peak)
      )
    }
    CostType::Peak => {
      let detail = if sub_entry {
        "consumed over"
      } else {
        "peak memory consumed over"
      };
      writeln!(
        out,
        "{} {detail} {} calls from{colon}",
        FormatBytes::new(data.peak),
        data.allocations
      )
    }
    CostType::Leaked => writeln!(
      out,
      "{} leaked over {} calls from{colon}",
      FormatBytes::new(data.leaked),
      data.allocations
    ),
    CostType::Temporary => {
      let percent = if data.allocations == 0 {
        0.0
      } else {
        data.temporary as f64 * 100.0 / data.allocations as f64
      };
      writeln!(
        out,
        "{} temporary allocations of {} allocations in total \
         ({percent:.2}%) from{colon}",
        data.temporary, data.allocations
      )
    }
  }
}

fn write_residual<W: Write>(
  out: &mut W,
  cost: CostType,
  residual: i64,
  places: usize,
) -> io::Result<()> {
  match cost {
    CostType::Allocations | CostType::Temporary => {
      writeln!(out, "  and {residual} from {places} other places")
    }
    CostType::Leaked | CostType::Peak => writeln!(
      out,
      "  and {} from {places} other places",
      FormatBytes::new(residual)
    ),
  }
}

/// Print the top entries of the merged allocations for one cost
/// dimension, each followed by its heaviest backtraces.
///
/// Entries are ordered by absolute cost so that report output stays
/// meaningful on the signed costs a diff produces, and the listing
/// stops at the first zero entry.
///
/// # Errors
///
/// Returns any error of the underlying writer.
pub fn print_merged<W: Write>(
  data: &TraceData,
  merged: &mut [MergedAllocation],
  cost: CostType,
  options: &ReportOptions,
  out: &mut W,
) -> io::Result<()> {
  merged
    .sort_by_key(|group| Reverse(group.data.cost(cost).unsigned_abs()));

  for group in merged.iter_mut().take(options.peak_limit) {
    if group.data.cost(cost) == 0 {
      break;
    }

    write_label(out, cost, &group.data, false)?;
    write_ip(data, data.ips.resolve(group.ip_index), options, 0, out)?;

    if !group.ip_index.is_valid() {
      continue;
    }

    group
      .traces
      .sort_by_key(|trace| Reverse(trace.data.cost(cost).unsigned_abs()));

    let mut handled = 0i64;
    for trace in group.traces.iter().take(options.sub_peak_limit) {
      if trace.data.cost(cost) == 0 {
        break;
      }
      write_label(out, cost, &trace.data, true)?;
      handled += trace.data.cost(cost);
      write_backtrace(data, trace.trace_index, options, 2, true, out)?;
    }

    if group.traces.len() > options.sub_peak_limit {
      write_residual(
        out,
        cost,
        group.data.cost(cost) - handled,
        group.traces.len() - options.sub_peak_limit,
      )?;
    }

    writeln!(out)?;
  }

  Ok(())
}

/// Print the top unmerged allocations for one cost dimension.
///
/// # Errors
///
/// Returns any error of the underlying writer.
pub fn print_unmerged<W: Write>(
  data: &TraceData,
  allocations: &mut [Allocation],
  cost: CostType,
  options: &ReportOptions,
  out: &mut W,
) -> io::Result<()> {
  allocations.sort_by_key(|allocation| {
    Reverse(allocation.data.cost(cost).unsigned_abs())
  });

  for allocation in allocations.iter().take(options.peak_limit) {
    if allocation.data.cost(cost) == 0 {
      break;
    }
    write_label(out, cost, &allocation.data, false)?;
    write_backtrace(data, allocation.trace_index, options, 1, false, out)?;
    writeln!(out)?;
  }

  Ok(())
}

fn write_flamegraph_ip<W: Write>(
  data: &TraceData,
  record: &InstructionPointer,
  options: &ReportOptions,
  out: &mut W,
) -> io::Result<()> {
  let write_file = |out: &mut W, file| -> io::Result<()> {
    let file = data.strings.resolve(file);
    let basename = file.rsplit('/').next().unwrap_or(file);
    write!(out, " ({basename})")
  };

  if record.frame.function.is_valid() {
    let function = data.strings.resolve(record.frame.function);
    write!(out, "{}", pretty_function(function, options.shorten_templates))?;
  } else {
    write!(out, "0x{:x}", record.address)?;
  }
  if record.frame.file.is_valid() {
    write_file(out, record.frame.file)?;
  }
  write!(out, ";")?;

  for frame in &record.inlined {
    let function = data.strings.resolve(frame.function);
    write!(out, "{}", pretty_function(function, options.shorten_templates))?;
    if frame.file.is_valid() {
      write_file(out, frame.file)?;
    }
    write!(out, ";")?;
  }

  Ok(())
}

/// Write one folded-stack line per allocation, root frame first, with
/// the chosen cost as the trailing scalar.
///
/// # Errors
///
/// Returns any error of the underlying writer.
pub fn write_flamegraph<W: Write>(
  data: &TraceData,
  allocations: &[Allocation],
  cost: CostType,
  options: &ReportOptions,
  out: &mut W,
) -> io::Result<()> {
  for allocation in allocations {
    if allocation.trace_index.is_valid() {
      let chain: Vec<IpIndex> = data.walk(allocation.trace_index).collect();
      for ip_index in chain.iter().rev() {
        write_flamegraph_ip(data, data.ips.resolve(*ip_index), options, out)?;
      }
    } else {
      write!(out, "??")?;
    }
    writeln!(out, " {}", allocation.data.cost(cost))?;
  }

  Ok(())
}

/// Write the per-size allocation histogram, ascending by size.
///
/// # Errors
///
/// Returns any error of the underlying writer.
pub fn write_histogram<W: Write>(
  histogram: &BTreeMap<u64, u64>,
  out: &mut W,
) -> io::Result<()> {
  for (size, count) in histogram {
    writeln!(out, "{size}\t{count}")?;
  }
  Ok(())
}

/// Print the end-of-run summary statistics.
///
/// # Errors
///
/// Returns any error of the underlying writer.
pub fn print_summary<W: Write>(
  data: &TraceData,
  total_suppressed: i64,
  suppressions: &[Suppression],
  print_suppressions: bool,
  out: &mut W,
) -> io::Result<()> {
  let per_second = if data.total_time == 0 {
    1.0
  } else {
    1000.0 / data.total_time as f64
  };
  let rate = |count: i64| (count as f64 * per_second) as i64;

  writeln!(out, "total runtime: {:.2}s.", data.total_time as f64 / 1000.0)?;
  writeln!(
    out,
    "calls to allocation functions: {} ({}/s)",
    data.total_cost.allocations,
    rate(data.total_cost.allocations)
  )?;
  writeln!(
    out,
    "temporary memory allocations: {} ({}/s)",
    data.total_cost.temporary,
    rate(data.total_cost.temporary)
  )?;
  writeln!(
    out,
    "peak heap memory consumption: {}",
    FormatBytes::new(data.total_cost.peak)
  )?;
  writeln!(
    out,
    "peak RSS (including profiler overhead): {}",
    FormatBytes::new(data.peak_rss_pages * data.system.page_size as i64)
  )?;
  writeln!(
    out,
    "total memory leaked: {}",
    FormatBytes::new(data.total_cost.leaked)
  )?;

  if total_suppressed != 0 {
    writeln!(
      out,
      "suppressed leaks: {}",
      FormatBytes::new(total_suppressed)
    )?;

    if print_suppressions {
      writeln!(out, "Suppressions used:")?;
      writeln!(out, "{:>16} {:>16} pattern", "matches", "leaked")?;
      for suppression in suppressions {
        if suppression.matches == 0 {
          continue;
        }
        writeln!(
          out,
          "{:>16} {} {}",
          suppression.matches,
          FormatBytes::padded(suppression.leaked, 16),
          suppression.pattern
        )?;
      }
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{data::testing::sample_data, merge::merge_allocations};

  fn render<F>(print: F) -> String
  where
    F: FnOnce(&mut Vec<u8>) -> io::Result<()>,
  {
    let mut buffer = Vec::new();
    print(&mut buffer).expect("writing to a vector cannot fail");
    String::from_utf8(buffer).expect("reports are UTF-8")
  }

  #[test]
  fn format_bytes_steps_through_units() {
    assert_eq!(FormatBytes::new(512).to_string(), "512B");
    assert_eq!(FormatBytes::new(-512).to_string(), "-512B");
    assert_eq!(FormatBytes::new(2_048).to_string(), "2.05KB");
    assert_eq!(FormatBytes::new(1_500_000).to_string(), "1.50MB");
    assert_eq!(FormatBytes::new(2_000_000_000).to_string(), "2.00GB");
    assert_eq!(FormatBytes::padded(100, 16).to_string(), "            100B");
  }

  #[test]
  fn pretty_function_collapses_template_arguments() {
    assert_eq!(
      pretty_function("std::vector<std::pair<int, float>>::push_back", true),
      "std::vector<>::push_back"
    );
    assert_eq!(pretty_function("plain_function", true), "plain_function");
    assert_eq!(
      pretty_function("std::vector<int>::size", false),
      "std::vector<int>::size"
    );
  }

  #[test]
  fn merged_report_lists_the_heaviest_call_site_first() {
    let data = sample_data();
    let mut merged = merge_allocations(&data, &data.allocations);

    let output = render(|out| {
      print_merged(
        &data,
        &mut merged,
        CostType::Allocations,
        &ReportOptions::default(),
        out,
      )
    });

    assert!(output.starts_with(
      "5 calls to allocation functions with 175B peak consumption from\n\
       allocate_something\n"
    ));
    assert!(output.contains("at peak.c:11"));
    assert!(output.contains("2 calls with 100B peak consumption from:"));
    assert!(output.contains("3 calls with 75B peak consumption from:"));
  }

  #[test]
  fn merged_report_stops_at_zero_cost_entries() {
    let data = sample_data();
    let mut merged = merge_allocations(&data, &data.allocations);

    let output = render(|out| {
      print_merged(
        &data,
        &mut merged,
        CostType::Leaked,
        &ReportOptions::default(),
        out,
      )
    });

    assert!(output.is_empty());
  }

  #[test]
  fn residual_line_sums_the_hidden_backtraces() {
    let data = sample_data();
    let mut merged = merge_allocations(&data, &data.allocations);

    let output = render(|out| {
      print_merged(
        &data,
        &mut merged,
        CostType::Allocations,
        &ReportOptions::default().with_limits(10, 1),
        out,
      )
    });

    assert!(output.contains("and 2 from 1 other places"));
  }

  #[test]
  fn unmerged_report_prints_full_backtraces() {
    let data = sample_data();
    let mut allocations = data.allocations.clone();

    let output = render(|out| {
      print_unmerged(
        &data,
        &mut allocations,
        CostType::Peak,
        &ReportOptions::default(),
        out,
      )
    });

    assert!(output.starts_with(
      "100B peak memory consumed over 2 calls from\n  allocate_something\n"
    ));
    assert!(output.contains("\n  foo\n"));
    assert!(output.contains("\n  main\n"));
  }

  #[test]
  fn flamegraph_lines_are_root_first() {
    let data = sample_data();

    let output = render(|out| {
      write_flamegraph(
        &data,
        &data.allocations,
        CostType::Peak,
        &ReportOptions::default(),
        out,
      )
    });

    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(
      lines,
      [
        "main (peak.c);foo (peak.c);allocate_something (peak.c); 100",
        "main (peak.c);bar (peak.c);allocate_something (peak.c); 75",
      ]
    );
  }

  #[test]
  fn flamegraph_renders_empty_traces_as_unknown() {
    let mut data = sample_data();
    data.allocations = vec![Allocation {
      trace_index: TraceIndex::default(),
      data: AllocationData {
        allocations: 1,
        ..AllocationData::default()
      },
    }];

    let output = render(|out| {
      write_flamegraph(
        &data,
        &data.allocations,
        CostType::Allocations,
        &ReportOptions::default(),
        out,
      )
    });

    assert_eq!(output, "?? 1\n");
  }

  #[test]
  fn histogram_is_sorted_by_size() {
    let mut histogram = BTreeMap::new();
    histogram.insert(100u64, 2u64);
    histogram.insert(25u64, 3u64);

    let output = render(|out| write_histogram(&histogram, out));
    assert_eq!(output, "25\t3\n100\t2\n");
  }

  #[test]
  fn summary_reports_totals_and_rates() {
    let data = sample_data();

    let output =
      render(|out| print_summary(&data, 0, &[], false, out));

    assert!(output.contains("total runtime: 2.00s."));
    assert!(output.contains("calls to allocation functions: 5 (2/s)"));
    assert!(output.contains("temporary memory allocations: 2 (1/s)"));
    assert!(output.contains("peak heap memory consumption: 125B"));
    assert!(output.contains("total memory leaked: 0B"));
    assert!(!output.contains("suppressed leaks"));
  }

  #[test]
  fn summary_appends_the_suppression_table() {
    let data = sample_data();
    let suppressions = vec![
      Suppression {
        pattern: "my_alloc".into(),
        matches: 1,
        leaked: 100,
      },
      Suppression::new("unused"),
    ];

    let output =
      render(|out| print_summary(&data, 100, &suppressions, true, out));

    assert!(output.contains("suppressed leaks: 100B"));
    assert!(output.contains("Suppressions used:"));
    assert!(output.contains("my_alloc"));
    assert!(!output.contains("unused"));
  }
}
