use super::*;

/// Streams massif-compatible heap snapshots while the reader fires
/// events.
///
/// Between snapshots the writer tracks the highest total of outstanding
/// bytes and keeps a copy of the allocation set from that instant, so a
/// detailed tree always reflects the peak composition of its interval
/// rather than the composition at the snapshot instant.
///
/// The writer owns its sink; a failed write logs one diagnostic and
/// latches the writer off so sibling reports keep running.
pub struct MassifWriter<W: Write> {
  at_peak: Vec<Allocation>,
  detailed_freq: u64,
  failed: bool,
  last_peak: i64,
  out: W,
  snapshot_id: u64,
  threshold_percent: f64,
}

impl<W: Write> MassifWriter<W> {
  /// Whether a write failed; the run should finish with an error exit.
  #[must_use]
  pub fn failed(&self) -> bool {
    self.failed
  }

  pub fn into_inner(self) -> W {
    self.out
  }

  fn latch(&mut self, result: io::Result<()>) {
    if let Err(source) = result {
      if !self.failed {
        error!("failed to write massif output: {source}");
      }
      self.failed = true;
    }
  }

  #[must_use]
  pub fn new(out: W, threshold_percent: f64, detailed_freq: u64) -> Self {
    Self {
      at_peak: Vec::new(),
      detailed_freq,
      failed: false,
      last_peak: 0,
      out,
      snapshot_id: 0,
      threshold_percent,
    }
  }

  /// Track the interval peak; called on every allocation event.
  pub fn observe_allocation(&mut self, data: &TraceData) {
    if data.total_cost.leaked > 0 && data.total_cost.leaked > self.last_peak
    {
      self.at_peak = data.allocations.clone();
      self.last_peak = data.total_cost.leaked;
    }
  }

  /// Emit the file header once the profiled command is known.
  pub fn write_header(&mut self, command: &str) {
    let result = writeln!(
      self.out,
      "desc: heaptrack\ncmd: {command}\ntime_unit: s"
    );
    self.latch(result);
  }

  /// Emit one snapshot block for the interval that just ended.
  pub fn write_snapshot(
    &mut self,
    data: &TraceData,
    time_stamp: i64,
    is_final: bool,
  ) {
    if self.failed {
      return;
    }

    if self.last_peak == 0 {
      self.at_peak = data.allocations.clone();
      self.last_peak = data.total_cost.leaked;
    }

    let result = self.write_snapshot_block(data, time_stamp, is_final);
    self.latch(result);

    self.snapshot_id += 1;
    self.last_peak = 0;
  }

  fn write_snapshot_block(
    &mut self,
    data: &TraceData,
    time_stamp: i64,
    is_final: bool,
  ) -> io::Result<()> {
    writeln!(
      self.out,
      "#-----------\nsnapshot={}\n#-----------\n\
       time={}\nmem_heap_B={}\nmem_heap_extra_B=0\nmem_stacks_B=0",
      self.snapshot_id,
      0.001 * time_stamp as f64,
      self.last_peak
    )?;

    let detailed = self.detailed_freq > 0
      && (is_final || self.snapshot_id % self.detailed_freq == 0);

    if detailed {
      writeln!(self.out, "heap_tree=detailed")?;
      let threshold =
        (self.last_peak as f64 * self.threshold_percent * 0.01) as i64;
      let at_peak = std::mem::take(&mut self.at_peak);
      let result = self.write_tree(
        data,
        &at_peak,
        self.last_peak,
        threshold,
        IpIndex::default(),
        0,
      );
      self.at_peak = at_peak;
      result
    } else {
      writeln!(self.out, "heap_tree=empty")
    }
  }

  fn write_below_threshold(
    &mut self,
    depth: usize,
    leaked: i64,
    places: usize,
  ) -> io::Result<()> {
    write_indent(&mut self.out, depth)?;
    writeln!(
      self.out,
      " n0: {leaked} in {places} places, all below massif's threshold ({})",
      self.threshold_percent
    )
  }

  /// Recursively emit the hierarchical heap tree for one node.
  ///
  /// Children are the allocations merged by their current leaf
  /// location, ordered by outstanding bytes; entries under the
  /// threshold aggregate into a single line, flushed in sort order.
  fn write_tree(
    &mut self,
    data: &TraceData,
    allocations: &[Allocation],
    heap_size: i64,
    threshold: i64,
    location: IpIndex,
    depth: usize,
  ) -> io::Result<()> {
    let mut merged = merge_allocations(data, allocations);
    merged.sort_by(|left, right| right.data.leaked.cmp(&left.data.leaked));

    let record = data.ips.resolve(location);
    let stop = data.strings.is_stop_index(record.frame.function);

    let mut children = 0usize;
    let mut skipped = 0usize;
    let mut skipped_leaked = 0i64;

    if !stop {
      for group in &mut merged {
        if group.data.leaked < 0 {
          // Sorted, so nothing below is of interest here.
          break;
        }

        if group.data.leaked >= threshold {
          children += 1;
          // Advance one frame towards the root so the recursion keys
          // each level by its caller.
          for trace in &mut group.traces {
            trace.trace_index =
              data.traces.resolve(trace.trace_index).parent_index;
          }
        } else {
          skipped += 1;
          skipped_leaked += group.data.leaked;
        }
      }
    }

    write_indent(&mut self.out, depth)?;
    write!(
      self.out,
      "n{}: {heap_size}",
      children + usize::from(skipped > 0)
    )?;
    if depth == 0 {
      writeln!(
        self.out,
        " (heap allocation functions) malloc/new/new[], --alloc-fns, etc."
      )?;
    } else {
      write!(self.out, " 0x{:x}: ", record.address)?;
      if record.frame.function.is_valid() {
        write!(self.out, "{}", data.strings.resolve(record.frame.function))?;
      } else {
        write!(self.out, "???")?;
      }
      write!(self.out, " (")?;
      if record.frame.file.is_valid() {
        write!(
          self.out,
          "{}:{}",
          data.strings.resolve(record.frame.file),
          record.frame.line
        )?;
      } else if record.module.is_valid() {
        write!(self.out, "{}", data.strings.resolve(record.module))?;
      } else {
        write!(self.out, "???")?;
      }
      writeln!(self.out, ")")?;
    }

    if !stop {
      for group in &merged {
        if group.data.leaked > 0 && group.data.leaked >= threshold {
          if skipped > 0 && skipped_leaked > group.data.leaked {
            // Flush the aggregate early to keep the output sorted.
            self.write_below_threshold(depth, skipped_leaked, skipped)?;
            skipped = 0;
          }
          self.write_tree(
            data,
            &group.traces,
            group.data.leaked,
            threshold,
            group.ip_index,
            depth + 1,
          )?;
        }
      }
      if skipped > 0 {
        self.write_below_threshold(depth, skipped_leaked, skipped)?;
      }
    }

    Ok(())
  }
}

fn write_indent<W: Write>(out: &mut W, depth: usize) -> io::Result<()> {
  for _ in 0..depth {
    out.write_all(b" ")?;
  }
  Ok(())
}
