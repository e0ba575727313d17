/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A workload that allocates and frees kernel page blocks on all CPUs.
//!
//! One worker thread per online CPU, pinned there for its lifetime, drives
//! the kernel module in a randomised burst pattern oscillating around a
//! nominal "middle" number of outstanding pages. Once every worker has held
//! the middle amount at least once the workload is considered to be in steady
//! state, which the orchestrator waits for before taking antagonised
//! measurements.

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::panic;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use nix::errno::Errno;
use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::ByteSize;
use crate::kmod::Page;
use crate::kmod::PageAllocator;
use crate::linux;
use crate::linux::NumaTopology;
use crate::sampling::Reservoir;
use crate::sync::Cancellation;
use crate::sync::OnceEvent;

/// Nominal outstanding pages per worker at steady state. This is a tuning
/// constant; historical builds also ran with 50,000.
pub const MIDDLE_PAGES: usize = 1000;

/// Burst targets are picked as `MIDDLE_PAGES ± U(0, BURST_SPREAD - 1)`.
pub const BURST_SPREAD: usize = 1000;

/// Capacity of each worker's latency reservoirs.
pub const LATENCY_RESERVOIR_CAPACITY: usize = 50_000;

const ALLOC_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const ALLOC_BACKOFF_GROWTH: f64 = 1.5;
const ALLOC_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Workload configuration. See the corresponding command line flags for the
/// meaning of the fields.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Informational; used to derive a per-CPU page count for logging.
    pub total_memory: ByteSize,
    /// If set, this file is read start-to-finish once before the workload
    /// begins, to populate the kernel page cache.
    pub test_data_path: Option<PathBuf>,
    /// Allocation order passed through to the kernel module.
    pub order: u32,
    /// Whether to collect latency samples into the per-worker reservoirs.
    pub measure_latencies: bool,
}

#[derive(Debug, Default)]
struct Stats {
    pages_allocated: AtomicU64, // Only incremented; subtract pages_freed to count leaks.
    pages_freed: AtomicU64,
    numa_remote: AtomicU64,
    alloc_failures: AtomicU64,
}

/// Latency samples aggregated over all workers, in nanoseconds.
#[derive(Debug, Default)]
pub struct Latencies {
    pub alloc_ns: Vec<i64>,
    /// Empty when the legacy free interface is in use (it reports none).
    pub free_ns: Vec<i64>,
}

/// Terminal counters and samples of one workload run.
#[derive(Debug, Default)]
pub struct Totals {
    pub pages_allocated: u64,
    pub pages_freed: u64,
    pub numa_remote: u64,
    pub alloc_failures: u64,
    pub latencies: Latencies,
}

/// The kallocfree workload. Construct with [`Workload::new`], then call
/// [`Workload::run`] exactly once.
#[derive(Debug)]
pub struct Workload<A> {
    allocator: A,
    topology: NumaTopology,
    cpus: Vec<usize>,
    pin_workers: bool,
    order: u32,
    measure_latencies: bool,
    test_data_path: Option<PathBuf>,
    pages_per_cpu: i64,
    backoff_initial: Duration,
    stats: Stats,
    steady_workers: AtomicUsize,
    steady: OnceEvent,
    free_error_logged: AtomicBool,
    ran: AtomicBool,
}

impl<A: PageAllocator> Workload<A> {
    /// Validate the machine's NUMA topology and set up a workload driving
    /// `allocator` from every online CPU.
    pub fn new(options: Options, allocator: A) -> Result<Self> {
        let topology = NumaTopology::detect().context("discovering NUMA topology")?;
        Ok(Self::with_topology(options, allocator, topology, true))
    }

    fn with_topology(
        options: Options,
        allocator: A,
        topology: NumaTopology,
        pin_workers: bool,
    ) -> Self {
        let cpus: Vec<usize> = (0..topology.cpu_count()).collect();
        assert!(!cpus.is_empty(), "topology with no CPUs");
        let pages_per_cpu = options.total_memory.pages() / cpus.len() as i64;
        Self {
            allocator,
            topology,
            cpus,
            pin_workers,
            order: options.order,
            measure_latencies: options.measure_latencies,
            test_data_path: options.test_data_path,
            pages_per_cpu,
            backoff_initial: ALLOC_BACKOFF_INITIAL,
            stats: Stats::default(),
            steady_workers: AtomicUsize::new(0),
            steady: OnceEvent::new(),
            free_error_logged: AtomicBool::new(false),
            ran: AtomicBool::new(false),
        }
    }

    /// Block until every worker has held [`MIDDLE_PAGES`] outstanding pages
    /// at least once, or `cancel` fires. Returns whether steady state was
    /// reached.
    pub fn await_steady_state(&self, cancel: &Cancellation) -> bool {
        loop {
            if self.steady.wait_timeout(Duration::from_millis(50)) {
                return true;
            }
            if cancel.is_cancelled() {
                return false;
            }
        }
    }

    /// Run the workload until `cancel` fires or a worker hits a fatal error.
    /// A worker error cancels `cancel`, stopping the peers. May be called at
    /// most once.
    ///
    /// Returns the aggregated counters and the concatenation of all workers'
    /// reservoir samples.
    pub fn run(&self, cancel: &Cancellation) -> Result<Totals> {
        assert!(
            !self.ran.swap(true, Ordering::SeqCst),
            "kallocfree workload run twice"
        );
        self.setup().context("kallocfree workload setup")?;

        info!(
            workers = self.cpus.len(),
            pages_per_cpu = self.pages_per_cpu,
            order = self.order,
            "starting kallocfree workers"
        );

        let results: Vec<(usize, Result<Latencies>)> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .cpus
                .iter()
                .map(|&cpu| {
                    let handle = scope.spawn(move || {
                        let result = self.run_cpu(cpu, cancel);
                        if result.is_err() {
                            // Errgroup semantics: first failure stops peers.
                            cancel.cancel();
                        }
                        result
                    });
                    (cpu, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(cpu, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|payload| panic::resume_unwind(payload));
                    (cpu, result)
                })
                .collect()
        });

        let mut latencies = Latencies::default();
        let mut first_error = None;
        for (cpu, result) in results {
            match result {
                Ok(worker) => {
                    latencies.alloc_ns.extend(worker.alloc_ns);
                    latencies.free_ns.extend(worker.free_ns);
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error =
                            Some(err.context(format!("workload failed on CPU {}", cpu)));
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let totals = Totals {
            pages_allocated: self.stats.pages_allocated.load(Ordering::Relaxed),
            pages_freed: self.stats.pages_freed.load(Ordering::Relaxed),
            numa_remote: self.stats.numa_remote.load(Ordering::Relaxed),
            alloc_failures: self.stats.alloc_failures.load(Ordering::Relaxed),
            latencies,
        };
        info!(
            pages_allocated = totals.pages_allocated,
            pages_freed = totals.pages_freed,
            numa_remote = totals.numa_remote,
            alloc_failures = totals.alloc_failures,
            "kallocfree workload done"
        );
        Ok(totals)
    }

    /// Run once before the workers start.
    fn setup(&self) -> Result<()> {
        let Some(path) = &self.test_data_path else {
            return Ok(());
        };
        info!(path = %path.display(), "reading test data to populate the page cache");
        let mut file =
            File::open(path).with_context(|| format!("opening {}", path.display()))?;
        io::copy(&mut file, &mut io::sink())
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(())
    }

    /// Per-CPU worker body. Burst-allocates and frees around [`MIDDLE_PAGES`]
    /// until cancelled; frees everything it still holds on the way out.
    fn run_cpu(&self, cpu: usize, cancel: &Cancellation) -> Result<Latencies> {
        if self.pin_workers {
            linux::pin_to_cpu(cpu).with_context(|| format!("pinning worker to CPU {}", cpu))?;
        }
        let mut alloc_latencies = Reservoir::new(LATENCY_RESERVOIR_CAPACITY, cpu as u64);
        let mut free_latencies =
            Reservoir::new(LATENCY_RESERVOIR_CAPACITY, u64::MAX - cpu as u64);
        let mut pages: VecDeque<Page> = VecDeque::new();

        let result =
            self.burst_loop(cpu, cancel, &mut pages, &mut alloc_latencies, &mut free_latencies);

        // Free the remainder whether we're exiting via cancellation or error.
        for page in pages.drain(..) {
            self.free_page_accounted(&page, &mut free_latencies);
        }

        result.map(|()| Latencies {
            alloc_ns: alloc_latencies.into_samples(),
            free_ns: free_latencies.into_samples(),
        })
    }

    /// Oscillate the outstanding-page count around [`MIDDLE_PAGES`] until
    /// cancelled or a fatal allocation error.
    fn burst_loop(
        &self,
        cpu: usize,
        cancel: &Cancellation,
        pages: &mut VecDeque<Page>,
        alloc_latencies: &mut Reservoir<i64>,
        free_latencies: &mut Reservoir<i64>,
    ) -> Result<()> {
        let node = self.topology.node_of(cpu).map(|n| n as i32).unwrap_or(-1);
        // Deterministic per-worker PRNGs keep run-to-run comparisons
        // meaningful.
        let mut rng = Pcg64Mcg::seed_from_u64(cpu as u64);
        let mut reached_middle = false;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let spread = rng.gen_range(0..BURST_SPREAD);
            let target = if rng.gen_bool(0.5) {
                MIDDLE_PAGES + spread
            } else {
                MIDDLE_PAGES - spread
            };

            while pages.len() < target {
                let Some(page) = self.alloc_page_backoff(cancel)? else {
                    return Ok(()); // cancelled mid-burst
                };
                self.stats.pages_allocated.fetch_add(1, Ordering::Relaxed);
                if page.nid != node {
                    self.stats.numa_remote.fetch_add(1, Ordering::Relaxed);
                }
                if self.measure_latencies {
                    alloc_latencies.add(page.latency.as_nanos() as i64);
                }
                pages.push_back(page);
                if !reached_middle && pages.len() == MIDDLE_PAGES {
                    reached_middle = true;
                    self.note_steady_state();
                }
            }

            // Oldest first, so every page eventually cycles.
            while pages.len() > target {
                let Some(page) = pages.pop_front() else {
                    break;
                };
                self.free_page_accounted(&page, free_latencies);
                if !reached_middle && pages.len() == MIDDLE_PAGES {
                    reached_middle = true;
                    self.note_steady_state();
                }
            }
        }
    }

    /// Allocate one block, treating ENOMEM as transient: count it, back off
    /// exponentially (cancellable), retry. Returns None if cancelled.
    fn alloc_page_backoff(&self, cancel: &Cancellation) -> Result<Option<Page>> {
        let mut backoff = self.backoff_initial;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match self.allocator.alloc_page(self.order) {
                Ok(page) => return Ok(Some(page)),
                Err(Errno::ENOMEM) => {
                    self.stats.alloc_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        backoff_ms = backoff.as_millis() as u64,
                        "allocator returned ENOMEM, backing off"
                    );
                    if !cancel.sleep(backoff) {
                        return Ok(None);
                    }
                    backoff = backoff.mul_f64(ALLOC_BACKOFF_GROWTH).min(ALLOC_BACKOFF_MAX);
                }
                Err(errno) => {
                    return Err(anyhow::Error::new(errno)
                        .context(format!("allocating order-{} page block", self.order)));
                }
            }
        }
    }

    fn free_page_accounted(&self, page: &Page, free_latencies: &mut Reservoir<i64>) {
        match self.allocator.free_page(page) {
            Ok(latency) => {
                self.stats.pages_freed.fetch_add(1, Ordering::Relaxed);
                if self.measure_latencies {
                    if let Some(latency) = latency {
                        free_latencies.add(latency.as_nanos() as i64);
                    }
                }
            }
            Err(errno) => {
                // Module teardown reclaims whatever we fail to free, so log
                // the first failure and keep going.
                if !self.free_error_logged.swap(true, Ordering::Relaxed) {
                    error!(
                        "freeing page: {} (suppressing further free errors, module \
                         teardown will reclaim)",
                        errno
                    );
                }
            }
        }
    }

    fn note_steady_state(&self) {
        let reached = self.steady_workers.fetch_add(1, Ordering::AcqRel) + 1;
        if reached == self.cpus.len() {
            info!("all workers reached steady state");
            self.steady.signal();
        }
    }
}
