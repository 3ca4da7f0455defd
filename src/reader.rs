use std::{
  fs::File,
  path::{Path, PathBuf},
  str,
};

use memmap2::Mmap;
use tracing::warn;

use crate::{
  data::TraceData,
  error::AnalyzeError,
  event::{AllocationInfo, AllocationInfoIndex, EventHandler, ParsePass},
  frames::{Frame, InstructionPointer, IpIndex},
  strings::StringIndex,
  traces::TraceIndex,
};

/// Data format version this reader understands.
const FORMAT_VERSION: u64 = 1;

/// Walks the on-disk record stream and drives an event handler.
///
/// The file is a line-oriented stream of one-letter records with
/// lower-case hex fields. Malformed or unknown records are skipped
/// with a diagnostic; a missing or unsupported version record is
/// fatal.
pub struct Reader {
  map: Mmap,
  path: PathBuf,
}

impl Reader {
  /// Open and memory-map a trace data file.
  ///
  /// # Errors
  ///
  /// Returns an `Input` error when the file cannot be opened or
  /// mapped.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, AnalyzeError> {
    let path = path.as_ref().to_path_buf();

    let file = File::open(&path)
      .map_err(|source| AnalyzeError::input(&path, source))?;

    // SAFETY: the mapping is read-only and the file handle outlives
    // it for the lifetime of the reader.
    let map = unsafe { Mmap::map(&file) }
      .map_err(|source| AnalyzeError::input(&path, source))?;

    Ok(Self { map, path })
  }

  /// Run both parse passes, accumulating into `data` and firing
  /// `handler` along the way.
  ///
  /// # Errors
  ///
  /// Returns an `Input` error when the stream framing is broken.
  pub fn read<H: EventHandler>(
    &self,
    data: &mut TraceData,
    handler: &mut H,
  ) -> Result<(), AnalyzeError> {
    self.parse(data, handler, ParsePass::First)?;
    self.parse(data, handler, ParsePass::Second)
  }

  fn parse<H: EventHandler>(
    &self,
    data: &mut TraceData,
    handler: &mut H,
    pass: ParsePass,
  ) -> Result<(), AnalyzeError> {
    let text = str::from_utf8(&self.map)
      .map_err(|_| AnalyzeError::input(&self.path, "file is not UTF-8"))?;

    parse_text(text, data, handler, pass)
      .map_err(|message| AnalyzeError::input(&self.path, message))
  }
}

fn parse_text<H: EventHandler>(
  text: &str,
  data: &mut TraceData,
  handler: &mut H,
  pass: ParsePass,
) -> Result<(), String> {
  let accumulate = pass == ParsePass::First;

  let mut version_seen = false;
  let mut time_stamp = 0i64;

  for line in text.lines() {
    if line.is_empty() || line.starts_with('#') {
      continue;
    }

    let (record, fields) = match line.split_once(' ') {
      Some((record, fields)) => (record, fields),
      None => (line, ""),
    };

    if !version_seen {
      let Some(version) = (record == "v")
        .then(|| parse_hex(fields))
        .flatten()
      else {
        return Err("missing version record".into());
      };
      if version != FORMAT_VERSION {
        return Err(format!("unsupported data format version {version}"));
      }
      version_seen = true;
      continue;
    }

    match record {
      "v" => {
        if accumulate {
          warn!("duplicate version record ignored");
        }
      }
      "s" => {
        if accumulate {
          data.strings.intern(fields);
        }
      }
      "X" => {
        if accumulate {
          data.debuggee = fields.to_string();
          handler.handle_debuggee(fields);
        }
      }
      "S" => {
        if accumulate {
          data.embedded_suppressions.push(fields.to_string());
        }
      }
      "I" => {
        if accumulate {
          let mut values = fields.split_ascii_whitespace();
          let (Some(page_size), Some(pages)) =
            (next_hex(&mut values), next_hex(&mut values))
          else {
            warn!(line, "skipping malformed system info record");
            continue;
          };
          data.system.page_size = page_size;
          data.system.pages = pages;
        }
      }
      "R" => {
        if accumulate {
          let Some(pages) = parse_hex(fields) else {
            warn!(line, "skipping malformed peak RSS record");
            continue;
          };
          data.peak_rss_pages = pages as i64;
        }
      }
      "i" => {
        if accumulate {
          let Some(record) = parse_instruction_pointer(fields) else {
            warn!(line, "skipping malformed instruction pointer record");
            continue;
          };
          data.ips.intern(record);
        }
      }
      "t" => {
        if accumulate {
          let mut values = fields.split_ascii_whitespace();
          let (Some(ip), Some(parent)) =
            (next_hex(&mut values), next_hex(&mut values))
          else {
            warn!(line, "skipping malformed trace record");
            continue;
          };
          data
            .traces
            .intern(IpIndex(ip as u32), TraceIndex(parent as u32));
        }
      }
      "a" => {
        if accumulate {
          let mut values = fields.split_ascii_whitespace();
          let (Some(size), Some(trace)) =
            (next_hex(&mut values), next_hex(&mut values))
          else {
            warn!(line, "skipping malformed allocation info record");
            continue;
          };
          data.allocation_infos.push(AllocationInfo {
            size,
            trace_index: TraceIndex(trace as u32),
          });
        }
      }
      "+" | "-" => {
        if accumulate {
          let Some(info_index) = parse_hex(fields) else {
            warn!(line, "skipping malformed allocation event");
            continue;
          };
          let index = AllocationInfoIndex(info_index as u32);
          let Some(info) =
            data.allocation_infos.get(index.0 as usize).copied()
          else {
            warn!(line, "skipping allocation event with unknown info");
            continue;
          };
          if record == "+" {
            data.add_allocation(info, index);
            handler.handle_allocation(data, info, index);
          } else {
            data.add_deallocation(info, index);
          }
        }
      }
      "c" => {
        let Some(stamp) = parse_hex(fields) else {
          if accumulate {
            warn!(line, "skipping malformed timestamp record");
          }
          continue;
        };
        let new_stamp = stamp as i64;
        handler.handle_time_stamp(data, time_stamp, new_stamp, false, pass);
        time_stamp = new_stamp;
      }
      unknown => {
        if accumulate {
          warn!(record = unknown, "skipping unknown record");
        }
      }
    }
  }

  if accumulate {
    data.set_total_time(time_stamp);
  }

  handler.handle_time_stamp(data, time_stamp, time_stamp, true, pass);

  Ok(())
}

fn next_hex(values: &mut str::SplitAsciiWhitespace<'_>) -> Option<u64> {
  parse_hex(values.next()?)
}

fn parse_hex(field: &str) -> Option<u64> {
  u64::from_str_radix(field, 16).ok()
}

fn parse_instruction_pointer(fields: &str) -> Option<InstructionPointer> {
  let mut values = fields.split_ascii_whitespace();

  let address = next_hex(&mut values)?;
  let module = StringIndex(next_hex(&mut values)? as u32);

  let mut frames = Vec::new();
  while let Some(function) = values.next() {
    let function = StringIndex(parse_hex(function)? as u32);
    let file = StringIndex(next_hex(&mut values)? as u32);
    let line = next_hex(&mut values)? as u32;
    frames.push(Frame {
      function,
      file,
      line,
    });
  }

  let mut frames = frames.into_iter();

  Some(InstructionPointer {
    address,
    module,
    frame: frames.next().unwrap_or_default(),
    inlined: frames.collect(),
  })
}
