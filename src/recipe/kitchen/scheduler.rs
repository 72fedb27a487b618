// src/recipe/kitchen/scheduler.rs

//! Parallel execution of a build plan
//!
//! A coordinator on the calling thread hands formulas whose dependencies
//! are all installed to a bounded rayon pool and collects completions over
//! a channel. A failure skips everything that transitively depends on the
//! failed formula; independent branches keep going unless fail-fast is set.

use crate::error::{Error, ErrorClass, Result};
use crate::recipe::plan::BuildPlan;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::Kitchen;
use super::config::{CookOutcome, CookResult};
use super::sandbox::CancellationToken;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Cancel `token` when the process receives SIGINT
pub fn install_interrupt_handler(token: CancellationToken) -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic
    let previous = unsafe { sigaction(Signal::SIGINT, &action) };
    previous.map_err(|e| Error::InitError(format!("Failed to install SIGINT handler: {}", e)))?;

    thread::Builder::new()
        .name("sigint-watch".to_string())
        .spawn(move || {
            while !token.is_cancelled() {
                if INTERRUPTED.load(Ordering::SeqCst) {
                    warn!("Interrupted, stopping running builds");
                    token.cancel();
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
        })
        .map_err(|e| Error::InitError(format!("Failed to start interrupt watcher: {}", e)))?;
    Ok(())
}

/// Results of a plan run, in plan order
#[derive(Debug)]
pub struct RunReport {
    pub results: Vec<CookResult>,
    /// The run was cancelled by an interrupt rather than by fail-fast
    pub interrupted: bool,
}

impl RunReport {
    pub fn get(&self, name: &str) -> Option<&CookResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn all_installed(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_installed())
    }

    /// Skipped formulas grouped by the failure that caused the skip
    pub fn skipped_by_root_cause(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for result in &self.results {
            if let CookOutcome::Skipped { root_cause } = &result.outcome {
                groups.entry(root_cause).or_default().push(&result.name);
            }
        }
        groups
    }

    /// Class that decides the exit code, `None` when everything succeeded
    ///
    /// An interrupt wins, then checksum, resolution, build and finally
    /// test failures.
    pub fn error_class(&self) -> Option<ErrorClass> {
        if self.interrupted {
            return Some(ErrorClass::Interrupted);
        }
        let rank = |class: ErrorClass| match class {
            ErrorClass::Checksum => 5,
            ErrorClass::Resolution => 4,
            ErrorClass::Build => 3,
            ErrorClass::Other => 2,
            ErrorClass::Interrupted => 1,
            ErrorClass::Test => 0,
        };
        self.results
            .iter()
            .filter_map(|r| r.outcome.error_class())
            .max_by_key(|c| rank(*c))
    }
}

/// Runs every formula of a plan on a bounded worker pool
pub struct Scheduler<'a> {
    kitchen: &'a Kitchen,
    jobs: usize,
    fail_fast: bool,
}

impl<'a> Scheduler<'a> {
    pub fn new(kitchen: &'a Kitchen) -> Self {
        Self {
            kitchen,
            jobs: kitchen.config().jobs.max(1),
            fail_fast: kitchen.config().fail_fast,
        }
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn run(&self, plan: &BuildPlan) -> Result<RunReport> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .thread_name(|i| format!("cook-{i}"))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create worker pool: {}", e)))?;

        let graph = plan.graph();
        let position: BTreeMap<&str, usize> = plan
            .order()
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i))
            .collect();
        let mut waiting = graph.in_degrees();
        let mut ready: VecDeque<String> = plan
            .order()
            .into_iter()
            .filter(|name| waiting.get(*name).copied() == Some(0))
            .map(str::to_string)
            .collect();
        let mut results: BTreeMap<String, CookResult> = BTreeMap::new();
        let cancel = self.kitchen.cancel_token();
        let mut cancelled_by_us = false;

        info!(
            "Installing {} formula(s) with {} worker(s)",
            plan.len(),
            self.jobs
        );

        let (tx, rx) = mpsc::channel::<CookResult>();
        pool.in_place_scope(|scope| {
            let mut running = 0usize;
            loop {
                while running < self.jobs && !cancel.is_cancelled() {
                    let Some(name) = ready.pop_front() else { break };
                    let tx = tx.clone();
                    let kitchen = self.kitchen;
                    running += 1;
                    debug!("Dispatching {}", name);
                    scope.spawn(move |_| {
                        let result = kitchen.cook(plan, &name);
                        let _ = tx.send(result);
                    });
                }
                if running == 0 {
                    break;
                }

                let Ok(result) = rx.recv() else { break };
                running -= 1;
                let name = result.name.clone();

                if result.outcome.is_installed() {
                    let mut newly_ready: Vec<String> = Vec::new();
                    for dependent in graph.dependents(&name).into_iter().flatten() {
                        if results.contains_key(dependent) {
                            continue;
                        }
                        if let Some(count) = waiting.get_mut(dependent) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                newly_ready.push(dependent.clone());
                            }
                        }
                    }
                    newly_ready.sort_by_key(|n| position.get(n.as_str()).copied());
                    ready.extend(newly_ready);
                } else {
                    if let CookOutcome::Failed { error, .. } = &result.outcome {
                        if !matches!(error, Error::Cancelled) {
                            error!("{} failed: {}", name, error);
                            if self.fail_fast && !cancel.is_cancelled() {
                                warn!("Fail-fast: cancelling remaining builds");
                                cancelled_by_us = true;
                                cancel.cancel();
                            }
                        }
                    }
                    let skipped: BTreeSet<String> = graph
                        .transitive_dependents(&name)
                        .into_iter()
                        .filter(|d| !results.contains_key(d))
                        .collect();
                    if !skipped.is_empty() {
                        warn!(
                            "Skipping {} because {} failed",
                            skipped.iter().cloned().collect::<Vec<_>>().join(", "),
                            name
                        );
                    }
                    ready.retain(|r| !skipped.contains(r));
                    for dependent in skipped {
                        results.insert(dependent.clone(), CookResult::skipped(&dependent, &name));
                    }
                }
                results.insert(name, result);
            }
        });

        // Anything never dispatched was stopped by cancellation
        for name in plan.order() {
            if !results.contains_key(name) {
                results.insert(
                    name.to_string(),
                    CookResult::skipped(name, "cancelled"),
                );
            }
        }

        let ordered = plan
            .order()
            .into_iter()
            .filter_map(|name| results.remove(name))
            .collect();

        Ok(RunReport {
            results: ordered,
            interrupted: cancel.is_cancelled() && !cancelled_by_us,
        })
    }
}
