//! Directory work queue
//!
//! A queued file lives in exactly one of four sibling directories;
//! moving it between them is the only state transition. `input` to
//! `work` is the dequeue point, `done` and `error` are terminal, and
//! every `input` subdirectory is mirrored in the other three.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use hopper_common::Result;

/// The four locations a queued file can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Input,
    Work,
    Done,
    Error,
}

impl Location {
    pub fn dir_name(self) -> &'static str {
        match self {
            Location::Input => "input",
            Location::Work => "work",
            Location::Done => "done",
            Location::Error => "error",
        }
    }
}

/// One entry of an `input` subdirectory listing.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Path relative to the `input` root
    pub rel: PathBuf,
    pub is_dir: bool,
}

/// Directory layout for one pipeline:
/// `<base>/<name>/{input,work,done,error}`.
#[derive(Debug, Clone)]
pub struct DirQueue {
    root: PathBuf,
}

impl DirQueue {
    pub fn new(base: impl AsRef<Path>, name: &str) -> Self {
        Self {
            root: base.as_ref().join(name),
        }
    }

    /// Top directory for one location.
    pub fn dir(&self, loc: Location) -> PathBuf {
        self.root.join(loc.dir_name())
    }

    /// Absolute path of `rel` inside `loc`.
    pub fn path(&self, loc: Location, rel: &Path) -> PathBuf {
        self.dir(loc).join(rel)
    }

    /// Create the `work`/`done`/`error` mirrors of an `input`
    /// subdirectory. The `input` side itself is expected to exist.
    pub fn ensure_mirrors(&self, rel_dir: &Path) -> Result<()> {
        for loc in [Location::Work, Location::Done, Location::Error] {
            fs::create_dir_all(self.path(loc, rel_dir))?;
        }
        Ok(())
    }

    /// Entries of an `input` subdirectory, lexicographically sorted so
    /// runs are reproducible.
    pub fn list_input(&self, rel_dir: &Path) -> Result<Vec<QueueEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.path(Location::Input, rel_dir))? {
            let entry = entry?;
            entries.push(QueueEntry {
                rel: rel_dir.join(entry.file_name()),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.rel.cmp(&b.rel));
        Ok(entries)
    }

    /// Age of a file since its last modification.
    pub fn age(&self, loc: Location, rel: &Path) -> Result<Duration> {
        let mtime = fs::metadata(self.path(loc, rel))?.modified()?;
        Ok(SystemTime::now()
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO))
    }

    /// Move `rel` from one location to another.
    pub fn promote(&self, rel: &Path, from: Location, to: Location) -> Result<()> {
        move_file(&self.path(from, rel), &self.path(to, rel))
    }

    /// Delete files older than `max_age` anywhere under `loc`, or only
    /// report them in dry-run. Maintenance entry point, usually pointed
    /// at `done` or `error`.
    pub fn clean(&self, loc: Location, max_age: Duration, dry_run: bool) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        clean_dir(&self.dir(loc), max_age, dry_run, &mut removed)?;
        Ok(removed)
    }
}

fn clean_dir(
    dir: &Path,
    max_age: Duration,
    dry_run: bool,
    removed: &mut Vec<PathBuf>,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            clean_dir(&path, max_age, dry_run, removed)?;
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        let age = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO);
        if age > max_age {
            tracing::info!(file = %path.display(), dry_run, "cleaning old file");
            if !dry_run {
                fs::remove_file(&path)?;
            }
            removed.push(path);
        }
    }
    Ok(())
}

/// Move a file, creating the target's parent directories as needed.
///
/// Falls back to copy + unlink when rename is not possible (the queue
/// directories may span filesystems).
pub(crate) fn move_file(src: &Path, dst: &Path) -> Result<()> {
    tracing::debug!(src = %src.display(), dst = %dst.display(), "move");
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)?;
            Ok(())
        }
    }
}

/// The input files claimed on behalf of one endpoint file.
///
/// The endpoint file is claimed first; populate methods may claim
/// dependency files afterwards. All of them settle together in the same
/// terminal directory, so a feed and its side files are never split
/// between `done` and `error`.
pub struct WorkSet<'a> {
    queue: &'a DirQueue,
    claimed: RefCell<Vec<PathBuf>>,
}

impl<'a> WorkSet<'a> {
    pub fn new(queue: &'a DirQueue) -> Self {
        Self {
            queue,
            claimed: RefCell::new(Vec::new()),
        }
    }

    /// Move `rel` from `input` to `work` and return its content.
    ///
    /// Claiming the same file again just re-reads it from the work
    /// area, so every record of an endpoint file can ask for the same
    /// dependency.
    pub fn claim(&self, rel: &Path) -> Result<String> {
        if !self.claimed.borrow().iter().any(|p| p == rel) {
            self.queue.promote(rel, Location::Input, Location::Work)?;
            self.claimed.borrow_mut().push(rel.to_path_buf());
        }
        let content = fs::read_to_string(self.queue.path(Location::Work, rel))?;
        Ok(content)
    }

    /// Relative paths claimed so far.
    pub fn claimed(&self) -> Vec<PathBuf> {
        self.claimed.borrow().clone()
    }

    /// Move every claimed file from `work` to its terminal directory.
    pub fn settle(&self, to: Location) -> Result<()> {
        for rel in self.claimed.borrow_mut().drain(..) {
            self.queue.promote(&rel, Location::Work, to)?;
        }
        Ok(())
    }
}
