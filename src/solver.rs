//! Nonce search for a [`Puzzle`].
//!
//! Workers pull candidate nonces from a shared [`NonceSource`] and report the
//! first hit over a bounded flume channel. Every iteration polls a
//! [`StopFlag`] with a relaxed load, so cancellation lands within one hash.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use derive_builder::Builder;
use flume::{Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PowError;
use crate::pow::{HashPow, PowHandler, Puzzle};

/// Hands out nonces in increasing order until `end` is reached.
#[derive(Debug)]
pub struct NonceSource {
    next: AtomicU64,
    end: u64,
}

impl NonceSource {
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
            end,
        }
    }

    #[inline]
    pub fn fetch(&self) -> Option<u64> {
        let nonce = self.next.fetch_add(1, Ordering::Relaxed);
        (nonce < self.end).then_some(nonce)
    }
}

#[derive(Debug, Default)]
pub struct StopFlag {
    stop: AtomicBool,
}

impl StopFlag {
    pub const fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn force_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned")]
pub struct Solver {
    #[builder(default = "1")]
    pub threads: usize,
    /// Exclusive upper bound of the search space.
    #[builder(default = "u64::MAX")]
    pub max_nonce: u64,
    #[builder(default = "Arc::new(HashPow::default()) as Arc<dyn PowHandler>")]
    pub pow: Arc<dyn PowHandler>,
}

impl Default for Solver {
    fn default() -> Self {
        Self {
            threads: 1,
            max_nonce: u64::MAX,
            pow: Arc::new(HashPow::default()),
        }
    }
}

impl SolverBuilder {
    pub fn build_validated(self) -> Result<Solver, PowError> {
        let solver = self
            .build()
            .map_err(|e| PowError::InvalidConfig(e.to_string()))?;
        solver.validate()?;
        Ok(solver)
    }
}

impl Solver {
    fn validate(&self) -> Result<(), PowError> {
        if self.threads == 0 {
            return Err(PowError::InvalidConfig("threads must be >= 1".into()));
        }
        if self.max_nonce == 0 {
            return Err(PowError::InvalidConfig("max_nonce must be > 0".into()));
        }
        Ok(())
    }

    /// Search for a nonce solving `puzzle`, blocking the current thread.
    ///
    /// With a single thread the search walks up from zero and returns the
    /// lowest solving nonce. Setting `cancel` aborts with [`PowError::Cancelled`].
    pub fn solve(&self, puzzle: &Puzzle, cancel: &Arc<StopFlag>) -> Result<u64, PowError> {
        self.validate()?;
        let nonces = NonceSource::new(0, self.max_nonce);
        if self.threads == 1 {
            let done = StopFlag::new();
            return search(self.pow.as_ref(), puzzle, &nonces, cancel, &done);
        }
        self.solve_parallel(puzzle, Arc::new(nonces), cancel)
    }

    fn solve_parallel(
        &self,
        puzzle: &Puzzle,
        nonces: Arc<NonceSource>,
        cancel: &Arc<StopFlag>,
    ) -> Result<u64, PowError> {
        let done = Arc::new(StopFlag::new());
        let (tx, rx): (Sender<u64>, Receiver<u64>) = flume::bounded(self.threads);
        let mut joins = Vec::with_capacity(self.threads);

        for _ in 0..self.threads {
            let worker_pow = self.pow.clone();
            let worker_puzzle = puzzle.clone();
            let worker_nonces = nonces.clone();
            let worker_cancel = cancel.clone();
            let worker_done = done.clone();
            let worker_tx = tx.clone();
            joins.push(thread::spawn(move || {
                let found = search(
                    worker_pow.as_ref(),
                    &worker_puzzle,
                    &worker_nonces,
                    &worker_cancel,
                    &worker_done,
                );
                if let Ok(nonce) = found {
                    let _ = worker_tx.try_send(nonce);
                }
            }));
        }
        drop(tx);

        let found = rx.recv().ok();
        done.force_stop();
        join_handles(joins);

        match found {
            Some(nonce) => Ok(nonce),
            None if cancel.should_stop() => Err(PowError::Cancelled),
            None => Err(PowError::NotFound),
        }
    }

    /// Run [`Solver::solve`] on a blocking thread until it finishes, `timeout`
    /// elapses or `token` is cancelled.
    pub async fn solve_until(
        &self,
        puzzle: Puzzle,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<u64, PowError> {
        let cancel = Arc::new(StopFlag::new());
        let flag = cancel.clone();
        let solver = self.clone();
        let mut task = tokio::task::spawn_blocking(move || solver.solve(&puzzle, &flag));

        tokio::select! {
            joined = &mut task => {
                return joined.map_err(|e| PowError::SolverFailed(e.to_string()))?;
            }
            _ = tokio::time::sleep(timeout) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "solver deadline reached");
            }
            _ = token.cancelled() => {
                debug!("solver cancelled");
            }
        }

        cancel.force_stop();
        task.await
            .map_err(|e| PowError::SolverFailed(e.to_string()))?
    }
}

fn search(
    pow: &dyn PowHandler,
    puzzle: &Puzzle,
    nonces: &NonceSource,
    cancel: &StopFlag,
    done: &StopFlag,
) -> Result<u64, PowError> {
    while let Some(nonce) = nonces.fetch() {
        if cancel.should_stop() {
            return Err(PowError::Cancelled);
        }
        if done.should_stop() {
            break;
        }
        if puzzle.accepts(pow, nonce) {
            return Ok(nonce);
        }
    }
    Err(PowError::NotFound)
}

fn join_handles(joins: Vec<thread::JoinHandle<()>>) {
    for handle in joins {
        let _ = handle.join();
    }
}
