//! # Stage: Statistics Logger
//!
//! ## Responsibility
//! Persist one [`Statistics`] record per scanned build and bump
//! `last_occurred` on the causes it matched.  Work runs on a single
//! dedicated thread so build completion never waits on the knowledge base.
//!
//! ## Guarantees
//! - Records are written in submission order
//! - Knowledge-base failures are logged, never propagated
//! - `stop()` drains queued records before joining
//!
//! ## NOT Responsible For
//! - Deciding whether a build is scanned (see `scan::service`)

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::kb::KnowledgeBase;
use crate::model::{BuildInfo, FailureCauseStatistics, FoundFailureCause, Statistics};

const NO_NODE: &str = "NoNodeInformation";

enum Job {
    Log(Box<Statistics>),
    Flush(mpsc::Sender<()>),
}

pub struct StatisticsLogger {
    kb: Arc<dyn KnowledgeBase>,
    master_name: String,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StatisticsLogger {
    /// Spawn the logger thread.  `master_name` labels records whose build
    /// does not name its controller.
    pub fn start(kb: Arc<dyn KnowledgeBase>, master_name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker_kb = Arc::clone(&kb);
        let worker = thread::Builder::new()
            .name("bfa-statistics-logger".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Log(stat) => persist(worker_kb.as_ref(), &stat),
                        Job::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                debug!("statistics logger exiting");
            });
        let (jobs, worker) = match worker {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                error!(error = %e, "failed to spawn statistics logger, statistics will not be recorded");
                (None, None)
            }
        };
        Self {
            kb,
            master_name: master_name.into(),
            jobs: Mutex::new(jobs),
            worker: Mutex::new(worker),
        }
    }

    /// Queue a record for `info` with the causes found for it.  No-op when
    /// the knowledge base has statistics disabled.
    pub fn log(&self, info: &BuildInfo, causes: &[FoundFailureCause]) {
        if !self.kb.is_statistics_enabled() {
            return;
        }
        let stat = build_statistics(info, causes, &self.master_name);
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.as_ref() {
            Some(tx) => {
                if tx.send(Job::Log(Box::new(stat))).is_err() {
                    warn!(build = %info.build, "statistics logger gone, record dropped");
                }
            }
            None => warn!(build = %info.build, "statistics logger stopped, record dropped"),
        }
    }

    /// Block until every record queued so far has been processed.
    pub fn flush(&self) {
        let (tx, rx) = mpsc::channel();
        let sent = {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            match jobs.as_ref() {
                Some(j) => j.send(Job::Flush(tx)).is_ok(),
                None => false,
            }
        };
        if sent {
            let _ = rx.recv();
        }
    }

    pub fn stop(&self) {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if handle.join().is_err() {
                error!("statistics logger panicked");
            }
        }
    }
}

impl Drop for StatisticsLogger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn persist(kb: &dyn KnowledgeBase, stat: &Statistics) {
    if let Err(e) = kb.save_statistics(stat) {
        warn!(
            error = %e,
            project = %stat.project_name,
            build = stat.build_number,
            "failed to save statistics"
        );
    }
    let ids = stat.cause_ids();
    if ids.is_empty() {
        return;
    }
    if let Err(e) = kb.update_last_seen(&ids, stat.start_time) {
        warn!(error = %e, causes = ids.len(), "failed to update last seen");
    }
}

/// Assemble the record for one build.
pub fn build_statistics(info: &BuildInfo, causes: &[FoundFailureCause], master_name: &str) -> Statistics {
    Statistics {
        project_name: info.build.project.clone(),
        build_number: info.build.number,
        display_name: info.display_name.clone(),
        start_time: info.start_time_ms,
        duration: info.duration_ms,
        trigger_causes: info.trigger_causes.clone(),
        node_name: info.node_name.clone().unwrap_or_else(|| NO_NODE.to_string()),
        master: info.master.clone().unwrap_or_else(|| master_name.to_string()),
        time_zone_offset: info.time_zone_offset.clone(),
        result: info.result.to_string(),
        upstream_cause: info.upstream.clone(),
        failure_causes: causes
            .iter()
            .map(|c| FailureCauseStatistics {
                id: c.id.clone(),
                indications: c.indications.clone(),
            })
            .collect(),
    }
}
