use std::{
  env, fs,
  path::{Path, PathBuf},
  process,
  sync::atomic::{AtomicU32, Ordering},
};

static NEXT_FILE: AtomicU32 = AtomicU32::new(0);

/// Trace fixture mirroring a tiny program: `foo` allocates 100 bytes
/// twice and `bar` 25 bytes three times through `allocate_something`,
/// which inhabits two distinct addresses, and everything is freed
/// again.
pub const PEAK_TRACE: &str = "\
v 1
X ./peak
I 1000 19a
s main
s foo
s bar
s allocate_something
s peak.c
s peak
i 101 6 1 5 18
i 102 6 2 5 10
i 103 6 3 5 15
i 104 6 4 5 b
i 105 6 4 5 b
t 1 0
t 2 1
t 4 2
t 3 1
t 5 4
a 64 3
a 19 5
c 3e8
+ 0
+ 1
- 0
+ 1
+ 1
- 1
- 1
- 1
+ 0
- 0
c 7d0
R 64
";

/// A trace data file on disk, removed again when dropped.
pub struct TraceFile {
  path: PathBuf,
}

impl TraceFile {
  pub fn new(name: &str, content: &str) -> Self {
    let path = env::temp_dir().join(format!(
      "heapreport-{}-{}-{name}",
      process::id(),
      NEXT_FILE.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&path, content).expect("failed to write trace fixture");
    Self { path }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for TraceFile {
  fn drop(&mut self) {
    let _ = fs::remove_file(&self.path);
  }
}
