use std::{
  fmt::{self, Display, Formatter},
  io,
  path::PathBuf,
};

/// Errors surfaced while analyzing a trace file.
///
/// Expected conditions never panic; everything fallible in the crate
/// returns one of these variants.
#[derive(Debug)]
pub enum AnalyzeError {
  /// Invalid option combination, detected before parsing starts.
  Config(String),
  /// An aggregation invariant was violated while finalizing.
  Data(String),
  /// The input data file cannot be opened or its framing is broken.
  Input { path: PathBuf, message: String },
  /// A report output file cannot be opened or written.
  Output { path: PathBuf, source: io::Error },
  /// The suppression file cannot be read or contains malformed lines.
  Suppressions { path: PathBuf, message: String },
}

impl Display for AnalyzeError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Config(message) => write!(f, "configuration error: {message}"),
      Self::Data(message) => write!(f, "data integrity error: {message}"),
      Self::Input { path, message } => {
        write!(f, "failed to read {}: {message}", path.display())
      }
      Self::Output { path, source } => {
        write!(f, "failed to write {}: {source}", path.display())
      }
      Self::Suppressions { path, message } => {
        write!(
          f,
          "failed to load suppressions from {}: {message}",
          path.display()
        )
      }
    }
  }
}

impl std::error::Error for AnalyzeError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Output { source, .. } => Some(source),
      _ => None,
    }
  }
}

impl AnalyzeError {
  #[must_use]
  pub fn input(path: impl Into<PathBuf>, message: impl Display) -> Self {
    Self::Input {
      path: path.into(),
      message: message.to_string(),
    }
  }

  #[must_use]
  pub fn output(path: impl Into<PathBuf>, source: io::Error) -> Self {
    Self::Output {
      path: path.into(),
      source,
    }
  }

  #[must_use]
  pub fn suppressions(
    path: impl Into<PathBuf>,
    message: impl Display,
  ) -> Self {
    Self::Suppressions {
      path: path.into(),
      message: message.to_string(),
    }
  }
}
