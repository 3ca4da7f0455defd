//! Command line analyzer for recorded heap allocation trace files.

use {
  clap::{ArgAction, Parser},
  heapreport::{
    AllocationInfo, AllocationInfoIndex, AnalyzeError, CostType, EventHandler,
    MassifWriter, ParsePass, Reader, ReportOptions, SuppressionOptions,
    TraceData, apply_leak_suppressions, build_suppressions,
    filter_allocations, merge_allocations, parse_suppressions_file,
    print_merged, print_summary, print_unmerged, write_flamegraph,
    write_histogram,
  },
  std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    thread,
  },
  tracing::{error, info},
  tracing_subscriber::EnvFilter,
};

/// Analyze heap allocation trace data files.
///
/// The profiler records every call to a heap allocation function
/// together with its backtrace; this tool evaluates the recorded data
/// and prints reports about it.
#[derive(Debug, Parser)]
#[command(name = "heapreport", version)]
struct Args {
  /// The trace data file to analyze.
  #[arg(short, long, value_name = "FILE")]
  file: PathBuf,

  /// Find the differences to this file.
  #[arg(short, long, value_name = "FILE")]
  diff: Option<PathBuf>,

  /// Shorten template identifiers.
  #[arg(
    short = 't',
    long,
    action = ArgAction::Set,
    default_value_t = true,
    default_missing_value = "true",
    num_args = 0..=1
  )]
  shorten_templates: bool,

  /// Merge backtraces that differ only by instruction address.
  #[arg(
    short = 'm',
    long,
    action = ArgAction::Set,
    default_value_t = true,
    default_missing_value = "true",
    num_args = 0..=1
  )]
  merge_backtraces: bool,

  /// Print backtraces to top allocators, sorted by peak consumption.
  #[arg(
    short = 'p',
    long,
    action = ArgAction::Set,
    default_value_t = true,
    default_missing_value = "true",
    num_args = 0..=1
  )]
  print_peaks: bool,

  /// Print backtraces to top allocators, sorted by number of calls to
  /// allocation functions.
  #[arg(
    short = 'a',
    long,
    action = ArgAction::Set,
    default_value_t = true,
    default_missing_value = "true",
    num_args = 0..=1
  )]
  print_allocators: bool,

  /// Print backtraces to top allocators, sorted by number of temporary
  /// allocations.
  #[arg(
    short = 'T',
    long,
    action = ArgAction::Set,
    default_value_t = true,
    default_missing_value = "true",
    num_args = 0..=1
  )]
  print_temporary: bool,

  /// Print backtraces to leaked memory allocations.
  #[arg(
    short = 'l',
    long,
    action = ArgAction::Set,
    default_value_t = false,
    default_missing_value = "true",
    num_args = 0..=1
  )]
  print_leaks: bool,

  /// Limit the number of reported peaks.
  #[arg(short = 'n', long, default_value_t = 10)]
  peak_limit: usize,

  /// Limit the number of reported backtraces of merged peak locations.
  #[arg(short = 's', long, default_value_t = 5)]
  sub_peak_limit: usize,

  /// Path to output file where an allocation size histogram will be
  /// written to.
  #[arg(short = 'H', long, value_name = "PATH")]
  print_histogram: Option<PathBuf>,

  /// The cost type to use when generating a flamegraph.
  #[arg(long, default_value = "allocations", value_parser = parse_cost_type)]
  flamegraph_cost_type: CostType,

  /// Path to output file where a flamegraph compatible stack file will
  /// be written to, consumable by flamegraph.pl.
  #[arg(short = 'F', long, value_name = "PATH")]
  print_flamegraph: Option<PathBuf>,

  /// Path to output file where a massif compatible data file will be
  /// written to.
  #[arg(short = 'M', long, value_name = "PATH")]
  print_massif: Option<PathBuf>,

  /// Percentage of current memory usage, below which allocations are
  /// aggregated into a 'below threshold' entry of the massif output.
  #[arg(long, default_value_t = 1.0, value_name = "PERCENT")]
  massif_threshold: f64,

  /// Frequency of detailed snapshots in the massif output file; zero
  /// disables detailed snapshots.
  #[arg(long, default_value_t = 2, value_name = "N")]
  massif_detailed_freq: u64,

  /// Only print allocations where the backtrace contains the given
  /// function.
  #[arg(long, default_value = "", value_name = "FUNCTION")]
  filter_bt_function: String,

  /// Load leak suppressions from the specified file; one 'leak:'
  /// pattern per line.
  #[arg(long, value_name = "PATH")]
  suppressions: Option<PathBuf>,

  /// Ignore suppression definitions embedded into the trace data file.
  #[arg(long)]
  disable_embedded_suppressions: bool,

  /// Ignore the suppressions built into the analyzer.
  #[arg(long)]
  disable_builtin_suppressions: bool,

  /// Show statistics for matched suppressions.
  #[arg(
    long,
    action = ArgAction::Set,
    default_value_t = false,
    default_missing_value = "true",
    num_args = 0..=1
  )]
  print_suppressions: bool,
}

fn parse_cost_type(value: &str) -> Result<CostType, String> {
  value.parse()
}

/// Report-side consumer of reader events: the allocation size
/// histogram and the massif snapshot stream.
#[derive(Default)]
struct PrintHandler {
  massif: Option<MassifWriter<BufWriter<File>>>,
  size_histogram: Option<BTreeMap<u64, u64>>,
}

impl EventHandler for PrintHandler {
  fn handle_allocation(
    &mut self,
    data: &TraceData,
    info: AllocationInfo,
    _index: AllocationInfoIndex,
  ) {
    if let Some(histogram) = &mut self.size_histogram {
      *histogram.entry(info.size).or_insert(0) += 1;
    }
    if let Some(massif) = &mut self.massif {
      massif.observe_allocation(data);
    }
  }

  fn handle_debuggee(&mut self, command: &str) {
    println!("Debuggee command was: {command}");
    if let Some(massif) = &mut self.massif {
      massif.write_header(command);
    }
  }

  fn handle_time_stamp(
    &mut self,
    data: &TraceData,
    _old_stamp: i64,
    new_stamp: i64,
    is_final: bool,
    pass: ParsePass,
  ) {
    if pass != ParsePass::First {
      return;
    }
    if let Some(massif) = &mut self.massif {
      massif.write_snapshot(data, new_stamp, is_final);
    }
  }
}

/// Open one of the report output files, treating failure as
/// non-fatal: the remaining reports still run, the process exits
/// unsuccessfully at the end.
fn open_output(path: &Path, outputs_ok: &mut bool) -> Option<BufWriter<File>> {
  match File::create(path) {
    Ok(file) => Some(BufWriter::new(file)),
    Err(source) => {
      error!("{}", AnalyzeError::output(path, source));
      *outputs_ok = false;
      None
    }
  }
}

fn run(args: &Args) -> Result<bool, AnalyzeError> {
  let mut outputs_ok = true;

  let suppression_options = SuppressionOptions {
    disable_builtin: args.disable_builtin_suppressions,
    disable_embedded: args.disable_embedded_suppressions,
    user_patterns: match &args.suppressions {
      Some(path) => parse_suppressions_file(path)?,
      None => Vec::new(),
    },
  };

  let mut handler = PrintHandler::default();
  if args.print_histogram.is_some() {
    handler.size_histogram = Some(BTreeMap::new());
  }
  if let Some(path) = &args.print_massif {
    handler.massif = open_output(path, &mut outputs_ok).map(|out| {
      MassifWriter::new(out, args.massif_threshold, args.massif_detailed_freq)
    });
  }

  let mut data = TraceData::new();

  info!("reading file {}, this might take some time", args.file.display());

  let base = match &args.diff {
    Some(diff_path) => {
      info!("reading diff file {}", diff_path.display());
      thread::scope(|scope| -> Result<TraceData, AnalyzeError> {
        let diff_parse = scope.spawn(move || {
          let reader = Reader::open(diff_path)?;
          let mut base = TraceData::new();
          reader.read(&mut base, &mut ())?;
          Ok(base)
        });

        let reader = Reader::open(&args.file)?;
        reader.read(&mut data, &mut handler)?;

        diff_parse
          .join()
          .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
      })
      .map(Some)?
    }
    None => {
      let reader = Reader::open(&args.file)?;
      reader.read(&mut data, &mut handler)?;
      None
    }
  };

  if let Some(base) = base {
    data.diff(&base);
  }

  let mut suppressions = build_suppressions(
    &suppression_options,
    &data.embedded_suppressions,
  );
  let total_suppressed =
    apply_leak_suppressions(&mut data, &mut suppressions)?;
  filter_allocations(&mut data, &args.filter_bt_function);

  let mut allocations = std::mem::take(&mut data.allocations);
  let mut merged = merge_allocations(&data, &allocations);

  println!("finished reading file, now analyzing data:\n");

  let options = ReportOptions {
    merge_backtraces: args.merge_backtraces,
    peak_limit: args.peak_limit,
    shorten_templates: args.shorten_templates,
    sub_peak_limit: args.sub_peak_limit,
  };

  let stdout = io::stdout();
  let mut out = stdout.lock();

  let mut report = |cost, heading: &str| -> io::Result<()> {
    writeln!(out, "{heading}")?;
    if options.merge_backtraces {
      print_merged(&data, &mut merged, cost, &options, &mut out)?;
    } else {
      print_unmerged(&data, &mut allocations, cost, &options, &mut out)?;
    }
    writeln!(out)
  };

  let reports: [(bool, CostType, &str); 4] = [
    (
      args.print_allocators,
      CostType::Allocations,
      "MOST CALLS TO ALLOCATION FUNCTIONS",
    ),
    (args.print_peaks, CostType::Peak, "PEAK MEMORY CONSUMERS"),
    (args.print_leaks, CostType::Leaked, "MEMORY LEAKS"),
    (
      args.print_temporary,
      CostType::Temporary,
      "MOST TEMPORARY ALLOCATIONS",
    ),
  ];

  for (enabled, cost, heading) in reports {
    if enabled {
      report(cost, heading)
        .map_err(|source| AnalyzeError::output("<stdout>", source))?;
    }
  }
  drop(report);

  print_summary(
    &data,
    total_suppressed,
    &suppressions,
    args.print_suppressions,
    &mut out,
  )
  .map_err(|source| AnalyzeError::output("<stdout>", source))?;
  out.flush().map_err(|source| AnalyzeError::output("<stdout>", source))?;

  if let Some(path) = &args.print_histogram {
    if let Some(histogram) = &handler.size_histogram {
      if let Some(mut out) = open_output(path, &mut outputs_ok) {
        if let Err(source) =
          write_histogram(histogram, &mut out).and_then(|()| out.flush())
        {
          error!("{}", AnalyzeError::output(path, source));
          outputs_ok = false;
        }
      }
    }
  }

  if let Some(path) = &args.print_flamegraph {
    if let Some(mut out) = open_output(path, &mut outputs_ok) {
      if let Err(source) = write_flamegraph(
        &data,
        &allocations,
        args.flamegraph_cost_type,
        &options,
        &mut out,
      )
      .and_then(|()| out.flush())
      {
        error!("{}", AnalyzeError::output(path, source));
        outputs_ok = false;
      }
    }
  }

  if let Some(massif) = handler.massif.take() {
    if massif.failed() {
      outputs_ok = false;
    }
    if let Err(source) = massif.into_inner().flush() {
      if let Some(path) = &args.print_massif {
        error!("{}", AnalyzeError::output(path, source));
      }
      outputs_ok = false;
    }
  }

  Ok(outputs_ok)
}

fn main() -> ExitCode {
  let args = match Args::try_parse() {
    Ok(args) => args,
    Err(err) => {
      let usage_only = matches!(
        err.kind(),
        clap::error::ErrorKind::DisplayHelp
          | clap::error::ErrorKind::DisplayVersion
      );
      let _ = err.print();
      return if usage_only {
        ExitCode::SUCCESS
      } else {
        ExitCode::FAILURE
      };
    }
  };

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .with_writer(io::stderr)
    .init();

  match run(&args) {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::FAILURE,
    Err(err) => {
      error!("{err}");
      ExitCode::FAILURE
    }
  }
}
