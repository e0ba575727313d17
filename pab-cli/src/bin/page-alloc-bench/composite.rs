/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The composite benchmark: for each allocation order, measure how much
//! memory userspace can get on an idle system, then again while kallocfree
//! hammers the kernel allocator in the background, and report everything as
//! one JSON object.

use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::panic;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use pab::ByteSize;
use pab::Cleanups;
use pab::kmod;
use pab::sync::Cancellation;
use pab::workload::findlimit;
use pab::workload::kallocfree;
use rand::RngCore;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use serde::Serialize;
use tracing::info;

/// Size of the file used to populate the page cache before each workload.
pub const TEST_DATA_SIZE: ByteSize = ByteSize::GIB;

#[derive(Debug, Parser, Clone)]
pub struct CompositeOpts {
    /// Total memory for the kallocfree engine to keep outstanding, in bytes.
    #[clap(long, value_name = "bytes", default_value_t = 256 * 1024 * 1024)]
    pub total_memory: i64,

    /// Overall deadline in seconds; on expiry partial results are emitted.
    /// 0 means no timeout.
    #[clap(long = "timeout-s", value_name = "seconds", default_value_t = 0)]
    pub timeout_s: u64,

    /// File to write the JSON results to. See README for the schema.
    /// Defaults to stdout.
    #[clap(long, value_name = "path")]
    pub output_path: Option<PathBuf>,

    /// Number of findlimit measurements per phase.
    #[clap(long, value_name = "count", default_value_t = 5)]
    pub iterations: usize,

    /// Allocation orders to sweep, comma separated.
    #[clap(
        long,
        value_name = "csv",
        use_value_delimiter = true,
        value_delimiter = ',',
        default_value = "0,4"
    )]
    pub alloc_orders: Vec<u32>,

    /// For dev: path to reuse for test data across runs.
    #[clap(long, value_name = "path")]
    pub test_data_path: Option<PathBuf>,

    /// The loaded kmod is an old build that uses the legacy FREE_PAGE
    /// interface (no free latencies).
    #[clap(long = "kmod-legacy-free-page")]
    pub kmod_legacy_free_page: bool,
}

/// Metric name → measurements. Single-valued metrics are 1-element arrays.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CompositeResult {
    pub metrics: BTreeMap<String, Vec<i64>>,
}

impl CompositeResult {
    /// Record `values` under `{metric}_order{order}`. Empty vectors (e.g.
    /// truncated by a timeout, or latencies under the legacy interface) are
    /// omitted rather than emitted as empty arrays.
    fn insert(&mut self, metric: &str, order: u32, values: Vec<i64>) {
        if values.is_empty() {
            return;
        }
        self.metrics
            .insert(format!("{}_order{}", metric, order), values);
    }
}

/// Run the whole benchmark and write the results.
pub fn run(opts: &CompositeOpts) -> Result<()> {
    let cancel = Cancellation::new();
    if opts.timeout_s > 0 {
        info!(timeout_s = opts.timeout_s, "arming global deadline");
        cancel.cancel_after(Duration::from_secs(opts.timeout_s));
    }

    let mut cleanups = Cleanups::default();
    let test_data_path = setup_test_data(
        &cancel,
        opts.test_data_path.as_deref(),
        TEST_DATA_SIZE,
        &mut cleanups,
    )?;

    let mut result = CompositeResult::default();
    for &order in &opts.alloc_orders {
        if cancel.is_cancelled() {
            break;
        }
        run_order(opts, &cancel, order, &test_data_path, &mut result)?;
    }
    if cancel.is_cancelled() {
        info!("deadline reached, emitting partial results");
    }

    write_output(opts.output_path.as_deref(), &result)
}

/// One full idle → antagonised sweep at a single allocation order.
fn run_order(
    opts: &CompositeOpts,
    cancel: &Cancellation,
    order: u32,
    test_data_path: &Path,
    result: &mut CompositeResult,
) -> Result<()> {
    info!(order, "assessing idle system memory availability");
    let idle = findlimit_series(cancel, opts.iterations)?;
    result.insert("idle_available_bytes", order, idle);
    if cancel.is_cancelled() {
        return Ok(());
    }

    let connection = kmod::Connection::open(opts.kmod_legacy_free_page)?;
    let workload = kallocfree::Workload::new(
        kallocfree::Options {
            total_memory: ByteSize(opts.total_memory),
            test_data_path: Some(test_data_path.to_path_buf()),
            order,
            measure_latencies: true,
        },
        connection,
    )?;

    // The engine gets a child token: cancelling it (deliberately, or because
    // a worker failed) must not tear down the whole benchmark.
    let engine_cancel = cancel.child();
    let (antagonized, totals) = thread::scope(|scope| {
        let engine = scope.spawn(|| workload.run(&engine_cancel));

        let steady = workload.await_steady_state(&engine_cancel);
        let series = if steady {
            info!(order, "steady state reached, measuring antagonized availability");
            findlimit_series(&engine_cancel, opts.iterations)
        } else {
            // Engine failure or global deadline; either way there is nothing
            // meaningful to measure.
            Ok(Vec::new())
        };

        engine_cancel.cancel();
        let engine_result = engine
            .join()
            .unwrap_or_else(|payload| panic::resume_unwind(payload));
        match (series, engine_result) {
            (Ok(antagonized), Ok(totals)) => Ok((antagonized, totals)),
            // The engine's own error beats a findlimit error its collapse
            // may have caused.
            (_, Err(err)) => Err(err.context("kallocfree workload")),
            (Err(err), Ok(_)) => Err(err),
        }
    })?;

    result.insert("antagonized_available_bytes", order, antagonized);
    result.insert(
        "kernel_page_allocs",
        order,
        vec![totals.pages_allocated as i64],
    );
    result.insert(
        "kernel_page_allocs_remote",
        order,
        vec![totals.numa_remote as i64],
    );
    result.insert(
        "kernel_alloc_failures",
        order,
        vec![totals.alloc_failures as i64],
    );
    result.insert(
        "kernel_page_alloc_latencies_ns",
        order,
        totals.latencies.alloc_ns,
    );
    result.insert(
        "kernel_page_free_latencies_ns",
        order,
        totals.latencies.free_ns,
    );
    Ok(())
}

/// Run findlimit up to `iterations` times, stopping early (with whatever was
/// collected) if `cancel` fires.
fn findlimit_series(cancel: &Cancellation, iterations: usize) -> Result<Vec<i64>> {
    let mut values = Vec::with_capacity(iterations);
    for iteration in 0..iterations {
        if cancel.is_cancelled() {
            break;
        }
        match findlimit::run(cancel, &findlimit::Options::default()) {
            Ok(measurement) => values.push(measurement.allocated.bytes()),
            // A kill from our own cancellation is not a measurement failure.
            Err(_) if cancel.is_cancelled() => break,
            Err(err) => {
                return Err(err.context(format!("findlimit iteration {}", iteration)));
            }
        }
    }
    Ok(values)
}

/// Create (or reuse) the file the workloads read to populate the page cache:
/// pseudorandom bytes, synced so the pages aren't dirty. Temporary files are
/// removed by `cleanups` at shutdown.
fn setup_test_data(
    cancel: &Cancellation,
    path: Option<&Path>,
    size: ByteSize,
    cleanups: &mut Cleanups,
) -> Result<PathBuf> {
    let (file, path) = match path {
        Some(path) => {
            if path.exists() {
                info!(path = %path.display(), "reusing test data file");
                return Ok(path.to_path_buf());
            }
            info!(path = %path.display(), size = %size, "creating reusable test data file");
            let file = File::create(path)
                .with_context(|| format!("creating test data file {}", path.display()))?;
            (file, path.to_path_buf())
        }
        None => {
            let temp = tempfile::NamedTempFile::new().context("creating test data file")?;
            // Persist it for the whole run; the cleanup removes it at exit.
            let (file, path) = temp.keep().context("keeping test data file")?;
            info!(path = %path.display(), size = %size, "creating test data file");
            let cleanup_path = path.clone();
            cleanups.push(move || {
                let _ = fs::remove_file(&cleanup_path);
            });
            (file, path)
        }
    };
    write_random_data(cancel, &file, size)?;
    Ok(path)
}

fn write_random_data(cancel: &Cancellation, mut file: &File, size: ByteSize) -> Result<()> {
    // Non-uniform bytes, so the data can't be deduplicated or compressed
    // into not occupying the page cache.
    let mut rng = Pcg64Mcg::seed_from_u64(0);
    let mut buf = vec![0u8; 1 << 20];
    let mut remaining = size.bytes();
    while remaining > 0 {
        if cancel.is_cancelled() {
            bail!("cancelled while writing test data");
        }
        let n = buf.len().min(remaining as usize);
        rng.fill_bytes(&mut buf[..n]);
        file.write_all(&buf[..n]).context("writing test data")?;
        remaining -= n as i64;
    }
    // Sync so the pages aren't dirty.
    file.sync_all().context("syncing test data")?;
    Ok(())
}

fn write_output(path: Option<&Path>, result: &CompositeResult) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("serialising results")?;
    match path {
        Some(path) => {
            fs::write(path, &json)
                .with_context(|| format!("writing results to {}", path.display()))?;
            info!(path = %path.display(), "wrote results");
        }
        None => println!("{}", json),
    }
    Ok(())
}
