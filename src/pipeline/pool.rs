use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use crossbeam::channel::{bounded, unbounded};
use tracing::{debug, info};

use crate::database::repo::SourceUrlRecord;
use crate::pipeline::candidate::{self, Candidate, Outcome, PipelineContext};

pub const DEFAULT_WORKERS: usize = 5;
pub const MAX_WORKERS: usize = 32;

/// Run-wide stop conditions, checked before each candidate is handed out.
pub struct RunControl {
    abort: Arc<AtomicBool>,
    deadline: Option<Instant>,
    target: usize,
    accepted: AtomicUsize,
}

impl RunControl {
    pub fn new(target: usize, deadline: Option<Instant>) -> Self {
        Self { abort: Arc::new(AtomicBool::new(false)), deadline, target, accepted: AtomicUsize::new(0) }
    }

    /// Flag that another thread (a signal handler) may set to stop the run.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn target_reached(&self) -> bool {
        self.accepted() >= self.target
    }

    fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.is_aborted() || self.deadline_passed() || self.target_reached()
    }
}

/// Fixed set of worker threads fed through a bounded queue. Each candidate
/// is processed end to end by whichever worker pulls it.
pub struct DownloadWorkerPool {
    workers: usize,
}

impl DownloadWorkerPool {
    pub fn new(workers: usize) -> Self {
        Self { workers: workers.clamp(1, MAX_WORKERS) }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Expands source pages into candidates in parallel. Sources not yet
    /// handed out when the run stops are left unvisited.
    pub fn visit_sources(
        &self,
        ctx: &PipelineContext,
        sources: Vec<(SourceUrlRecord, Vec<String>)>,
        control: &RunControl,
    ) -> Vec<Candidate> {
        let (job_tx, job_rx) = bounded::<(SourceUrlRecord, Vec<String>)>(self.workers * 2);
        let (out_tx, out_rx) = unbounded::<Vec<Candidate>>();

        thread::scope(|s| {
            for _ in 0..self.workers {
                let rx = job_rx.clone();
                let tx = out_tx.clone();
                s.spawn(move || {
                    for (source, hints) in rx {
                        let found: Vec<Candidate> = candidate::expand_source(ctx, &source, &hints)
                            .into_iter()
                            .map(|image_url| Candidate { source: source.clone(), image_url })
                            .collect();
                        if tx.send(found).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(out_tx);

            s.spawn(move || {
                for job in sources {
                    if control.should_stop() || job_tx.send(job).is_err() {
                        break;
                    }
                }
            });

            out_rx.iter().flatten().collect()
        })
    }

    /// Processes candidates until the list is drained or the run stops.
    /// `on_outcome` sees every finished candidate on the calling thread.
    /// Candidates already queued when the target is reached still finish,
    /// so a run can overshoot its target by up to the queue depth.
    pub fn process<F>(&self, ctx: &PipelineContext, candidates: Vec<Candidate>, control: &RunControl, mut on_outcome: F)
    where
        F: FnMut(&Candidate, &Outcome),
    {
        let total = candidates.len();
        let (job_tx, job_rx) = bounded::<Candidate>(self.workers);
        let (out_tx, out_rx) = unbounded::<(Candidate, Outcome)>();

        thread::scope(|s| {
            for i in 0..self.workers {
                let rx = job_rx.clone();
                let tx = out_tx.clone();
                s.spawn(move || {
                    debug!("Worker {} started", i);
                    for candidate in rx {
                        let outcome = candidate::process_candidate(ctx, &candidate);
                        if matches!(outcome, Outcome::Recorded { .. }) {
                            control.record_accept();
                        }
                        if tx.send((candidate, outcome)).is_err() {
                            break;
                        }
                    }
                    debug!("Worker {} finished", i);
                });
            }
            // Workers hold the only remaining ends, so the channels close when they finish.
            drop(job_rx);
            drop(out_tx);

            s.spawn(move || {
                let mut fed = 0;
                for candidate in candidates {
                    if control.should_stop() {
                        info!("Stopping feed with {} of {} candidates left", total - fed, total);
                        break;
                    }
                    if job_tx.send(candidate).is_err() {
                        break;
                    }
                    fed += 1;
                }
            });

            for (candidate, outcome) in out_rx.iter() {
                on_outcome(&candidate, &outcome);
            }
        });
    }
}
