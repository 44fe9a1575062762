//! Pipeline controller
//!
//! Owns the directory work queue for one configuration: discovers input
//! files depth-first, hands each one to a builder and routes it to its
//! terminal directory. One controller instance processes one tree
//! start to finish, one file at a time; concurrent runs over the same
//! tree are an operational responsibility, not handled here.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

use hopper_common::config::PipelineSettings;
use hopper_common::store::{Entity, EntityStore};
use hopper_common::Result;

use crate::builder::{BuildStatus, Builder, BuilderSpec};
use crate::matching::MatchingEngine;
use crate::queue::{DirQueue, Location, WorkSet};

/// Supplies per-file import definitions to the controller.
pub trait BuilderLoader {
    /// Decide whether (and how) `rel_path` is imported. `None` leaves
    /// the file in `input` untouched; it may still be claimed as a
    /// dependency by another import, or swept after the grace period.
    fn load_builder(&self, rel_path: &Path) -> Option<Box<dyn BuilderSpec>>;

    /// Called once after the walk with every entity produced across
    /// every file, including files that later routed to `error`.
    fn postprocess(&self, _entities: &[Box<dyn Entity>]) {}
}

/// Statistics for one [`Pipeline::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub files_done: usize,
    pub files_errored: usize,
    /// Younger than the quarantine age, retried next run
    pub files_quarantined: usize,
    /// No builder matched, left in place
    pub files_ignored: usize,
    /// Unclaimed past the grace period, archived to `done`
    pub files_swept: usize,
    /// Entities produced across all files
    pub entities: usize,
    /// A record requested a pipeline stop and the walk was aborted
    pub stopped: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            files_done: 0,
            files_errored: 0,
            files_quarantined: 0,
            files_ignored: 0,
            files_swept: 0,
            entities: 0,
            stopped: false,
            started_at,
            finished_at: started_at,
        }
    }
}

pub struct Pipeline<'a> {
    name: String,
    queue: DirQueue,
    loader: &'a dyn BuilderLoader,
    store: &'a dyn EntityStore,
    matching: &'a MatchingEngine,
    settings: PipelineSettings,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        base_dir: impl AsRef<Path>,
        name: &str,
        loader: &'a dyn BuilderLoader,
        store: &'a dyn EntityStore,
        matching: &'a MatchingEngine,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            name: name.to_string(),
            queue: DirQueue::new(base_dir, name),
            loader,
            store,
            matching,
            settings,
        }
    }

    pub fn queue(&self) -> &DirQueue {
        &self.queue
    }

    /// Process the whole `input` tree once.
    pub fn run(&self) -> Result<RunReport> {
        let started_at = Utc::now();
        tracing::info!(
            pipeline = %self.name,
            input = %self.queue.dir(Location::Input).display(),
            dry_run = self.settings.dry_run,
            "run"
        );

        let mut report = RunReport::new(started_at);
        let mut entities: Vec<Box<dyn Entity>> = Vec::new();
        self.process_dir(Path::new(""), &mut report, &mut entities)?;

        report.entities = entities.len();
        self.loader.postprocess(&entities);

        report.finished_at = Utc::now();
        tracing::info!(
            pipeline = %self.name,
            done = report.files_done,
            errored = report.files_errored,
            entities = report.entities,
            stopped = report.stopped,
            "run finished"
        );
        Ok(report)
    }

    /// Depth-first over one `input` subdirectory. Returns true when a
    /// pipeline stop was requested and the walk must not continue.
    fn process_dir(
        &self,
        rel_dir: &Path,
        report: &mut RunReport,
        entities: &mut Vec<Box<dyn Entity>>,
    ) -> Result<bool> {
        tracing::debug!(dir = %rel_dir.display(), "processing directory");
        self.queue.ensure_mirrors(rel_dir)?;

        for entry in self.queue.list_input(rel_dir)? {
            if entry.is_dir {
                if self.process_dir(&entry.rel, report, entities)? {
                    return Ok(true);
                }
                continue;
            }

            // a populate method may have claimed it as a dependency of
            // an earlier endpoint file
            if !self.queue.path(Location::Input, &entry.rel).exists() {
                continue;
            }

            if self.settings.quarantine_secs > 0 {
                let age = self.queue.age(Location::Input, &entry.rel)?;
                if age < Duration::from_secs(self.settings.quarantine_secs) {
                    tracing::info!(file = %entry.rel.display(), "too recent, left for next run");
                    report.files_quarantined += 1;
                    continue;
                }
            }

            let Some(spec) = self.loader.load_builder(&entry.rel) else {
                tracing::debug!(file = %entry.rel.display(), "no builder, ignored");
                report.files_ignored += 1;
                continue;
            };

            tracing::info!(file = %entry.rel.display(), "matched");
            if self.settings.dry_run {
                continue;
            }

            if self.process_file(&entry.rel, spec.as_ref(), report, entities)? {
                report.stopped = true;
                return Ok(true);
            }
        }

        if !self.settings.dry_run {
            self.sweep(rel_dir, report)?;
        }
        Ok(false)
    }

    /// Run one builder over one endpoint file and route the outcome.
    /// Returns true when the whole run must stop.
    fn process_file(
        &self,
        rel: &Path,
        spec: &dyn BuilderSpec,
        report: &mut RunReport,
        entities: &mut Vec<Box<dyn Entity>>,
    ) -> Result<bool> {
        let work = WorkSet::new(&self.queue);
        let content = match work.claim(rel) {
            Ok(content) => content,
            Err(err) => {
                tracing::error!(file = %rel.display(), error = %err, "claim failed");
                work.settle(Location::Error)?;
                report.files_errored += 1;
                return Ok(false);
            }
        };

        let builder = Builder::new(spec, self.store, self.matching).with_work(&work);
        match builder.process_and_save(rel, content) {
            Ok(output) => {
                entities.extend(output.entities);
                match output.status {
                    BuildStatus::Ok => {
                        work.settle(Location::Done)?;
                        report.files_done += 1;
                        Ok(false)
                    }
                    BuildStatus::HadErrors => {
                        tracing::warn!(file = %rel.display(), "finished with record errors");
                        work.settle(Location::Error)?;
                        report.files_errored += 1;
                        Ok(false)
                    }
                    BuildStatus::StoppedPipeline => {
                        tracing::warn!(file = %rel.display(), "pipeline stop requested, aborting run");
                        work.settle(Location::Error)?;
                        report.files_errored += 1;
                        Ok(true)
                    }
                }
            }
            Err(err) => {
                tracing::error!(file = %rel.display(), error = %err, "builder failed");
                work.settle(Location::Error)?;
                report.files_errored += 1;
                Ok(false)
            }
        }
    }

    /// Archive input files nobody claimed within the grace period.
    ///
    /// Dependency files only move when an endpoint file claims them;
    /// whatever is left after every import had its chance is either an
    /// orphan or a leftover of an errored endpoint.
    fn sweep(&self, rel_dir: &Path, report: &mut RunReport) -> Result<()> {
        for entry in self.queue.list_input(rel_dir)? {
            if entry.is_dir {
                continue;
            }
            let age = self.queue.age(Location::Input, &entry.rel)?;
            if age > Duration::from_secs(self.settings.grace_period_secs) {
                tracing::info!(file = %entry.rel.display(), "unclaimed past grace period, archiving");
                self.queue.promote(&entry.rel, Location::Input, Location::Done)?;
                report.files_swept += 1;
            }
        }
        Ok(())
    }
}
