/// Controls how the textual reports are rendered.
#[derive(Clone, Debug)]
pub struct ReportOptions {
  /// Merge call sites that differ only by instruction address.
  pub merge_backtraces: bool,
  /// Maximum number of entries per report.
  pub peak_limit: usize,
  /// Collapse template argument lists in displayed function names.
  pub shorten_templates: bool,
  /// Maximum number of backtraces shown below a merged entry.
  pub sub_peak_limit: usize,
}

impl Default for ReportOptions {
  fn default() -> Self {
    Self {
      merge_backtraces: true,
      peak_limit: 10,
      shorten_templates: true,
      sub_peak_limit: 5,
    }
  }
}

impl ReportOptions {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style helper to adjust the report caps.
  #[must_use]
  pub fn with_limits(mut self, peak: usize, sub_peak: usize) -> Self {
    self.peak_limit = peak;
    self.sub_peak_limit = sub_peak;
    self
  }
}
