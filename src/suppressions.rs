use std::{fs, path::Path};

use tracing::warn;

use crate::{data::TraceData, error::AnalyzeError};

/// Leak patterns built into the analyzer, matching allocations held by
/// runtime support code for the lifetime of the process.
const BUILTIN_SUPPRESSIONS: [&str; 3] = [
  "_dl_init",
  "_dl_allocate_tls",
  "__nss_module_allocate",
];

/// One leak pattern with its accumulated matches.
///
/// Counts grow monotonically while suppressions are applied.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Suppression {
  pub pattern: String,
  pub matches: u64,
  pub leaked: i64,
}

impl Suppression {
  #[must_use]
  pub fn new(pattern: impl Into<String>) -> Self {
    Self {
      pattern: pattern.into(),
      ..Self::default()
    }
  }
}

/// Which suppression sources participate in a run.
#[derive(Clone, Debug, Default)]
pub struct SuppressionOptions {
  pub disable_builtin: bool,
  pub disable_embedded: bool,
  pub user_patterns: Vec<String>,
}

/// Reassign leaked bytes of matching allocations into per-pattern
/// buckets.
///
/// Each allocation is tested against the suppressions in order and the
/// first one whose pattern is a substring of any function name on the
/// walked trace wins: the allocation's leak moves into that
/// suppression's bucket while its other counters stay intact.
/// Allocations without a trace never match.
///
/// Returns the total number of bytes suppressed.
///
/// # Errors
///
/// Returns a `Data` error when the per-suppression bookkeeping does
/// not add up to the reassigned total.
pub fn apply_leak_suppressions(
  data: &mut TraceData,
  suppressions: &mut [Suppression],
) -> Result<i64, AnalyzeError> {
  if suppressions.is_empty() {
    return Ok(0);
  }

  let mut total_suppressed = 0i64;

  for position in 0..data.allocations.len() {
    let allocation = data.allocations[position];
    if allocation.data.leaked <= 0 || !allocation.trace_index.is_valid() {
      continue;
    }

    let matched = {
      let mut functions: Vec<&str> = Vec::new();
      for ip_index in data.walk(allocation.trace_index) {
        let record = data.ips.resolve(ip_index);
        functions.push(data.strings.resolve(record.frame.function));
        functions.extend(
          record
            .inlined
            .iter()
            .map(|frame| data.strings.resolve(frame.function)),
        );
      }

      suppressions.iter().position(|suppression| {
        functions
          .iter()
          .any(|function| function.contains(&suppression.pattern))
      })
    };

    if let Some(winner) = matched {
      let leaked = allocation.data.leaked;
      suppressions[winner].matches += 1;
      suppressions[winner].leaked += leaked;
      data.allocations[position].data.leaked = 0;
      data.total_cost.leaked -= leaked;
      total_suppressed += leaked;
    }
  }

  let accounted: i64 = suppressions
    .iter()
    .map(|suppression| suppression.leaked)
    .sum();
  if accounted != total_suppressed {
    return Err(AnalyzeError::Data(format!(
      "suppressed {total_suppressed} bytes but accounted for {accounted}"
    )));
  }

  Ok(total_suppressed)
}

/// Assemble the combined suppression set: user patterns first, then the
/// patterns embedded in the data file, then the built-in set.
#[must_use]
pub fn build_suppressions(
  options: &SuppressionOptions,
  embedded: &[String],
) -> Vec<Suppression> {
  let mut suppressions: Vec<Suppression> = options
    .user_patterns
    .iter()
    .map(Suppression::new)
    .collect();

  if !options.disable_embedded {
    for line in embedded {
      match parse_line(line) {
        Some(pattern) => suppressions.push(Suppression::new(pattern)),
        None => {
          warn!(line = %line, "ignoring malformed embedded suppression");
        }
      }
    }
  }

  if !options.disable_builtin {
    suppressions.extend(BUILTIN_SUPPRESSIONS.map(Suppression::new));
  }

  suppressions
}

fn parse_line(line: &str) -> Option<&str> {
  let line = line.trim();
  line.strip_prefix("leak:").map(str::trim)
}

/// Load leak patterns from a suppression file, one `leak:<pattern>` per
/// line; blank lines and `#` comments are skipped.
///
/// # Errors
///
/// Returns a `Suppressions` error when the file cannot be read or a
/// line is malformed.
pub fn parse_suppressions_file(
  path: &Path,
) -> Result<Vec<String>, AnalyzeError> {
  let content = fs::read_to_string(path)
    .map_err(|source| AnalyzeError::suppressions(path, source))?;

  parse_patterns(&content)
    .map_err(|message| AnalyzeError::suppressions(path, message))
}

fn parse_patterns(content: &str) -> Result<Vec<String>, String> {
  let mut patterns = Vec::new();

  for (number, line) in content.lines().enumerate() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }

    match parse_line(line) {
      Some(pattern) if !pattern.is_empty() => {
        patterns.push(pattern.to_string());
      }
      _ => {
        return Err(format!(
          "malformed suppression on line {}: {line:?}",
          number + 1
        ));
      }
    }
  }

  Ok(patterns)
}
