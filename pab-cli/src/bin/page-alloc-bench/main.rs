/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

// Treat all Clippy warnings as errors.
#![deny(clippy::all)]
#![allow(clippy::uninlined_format_args)]

mod composite;
mod global_opts;
mod tracing;

use clap::Parser;
use colored::Colorize;
use pab::Error;

use self::composite::CompositeOpts;
use self::global_opts::GlobalOpts;

/// Benchmarks the kernel's page allocator under contention.
///
/// For each requested allocation order this measures how much memory
/// userspace can allocate before being OOM-killed, first on an idle system
/// and then while the kallocfree workload saturates the kernel page
/// allocator from every CPU, and reports the results (along with in-kernel
/// allocation latencies and NUMA locality counters) as JSON.
///
/// Requires the page_alloc_bench kernel module to be loaded, and a host you
/// are willing to drive to OOM repeatedly.
#[derive(Debug, Parser)]
#[clap(name = "page-alloc-bench", version)]
struct Args {
    #[clap(flatten)]
    global: GlobalOpts,

    #[clap(flatten)]
    composite: CompositeOpts,
}

fn main() {
    let args = Args::parse();
    let _guard = args.global.init_tracing();

    if let Err(err) = composite::run(&args.composite) {
        display_error(err);
        std::process::exit(1);
    }
}

fn display_error(error: Error) {
    let mut chain = error.chain();

    if let Some(error) = chain.next() {
        eprintln!("{}: {}", "Error".red().bold(), error);
    }

    for cause in chain {
        eprintln!("     {} {}", ">".dimmed().bold(), cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags() {
        let args = Args::try_parse_from(["page-alloc-bench"]).unwrap();
        assert_eq!(args.composite.total_memory, 256 * 1024 * 1024);
        assert_eq!(args.composite.timeout_s, 0);
        assert_eq!(args.composite.iterations, 5);
        assert_eq!(args.composite.alloc_orders, vec![0, 4]);
        assert!(args.composite.output_path.is_none());
        assert!(args.composite.test_data_path.is_none());
        assert!(!args.composite.kmod_legacy_free_page);
    }

    #[test]
    fn alloc_orders_parse_as_csv() {
        let args =
            Args::try_parse_from(["page-alloc-bench", "--alloc-orders=0,1,9"]).unwrap();
        assert_eq!(args.composite.alloc_orders, vec![0, 1, 9]);
    }

    #[test]
    fn bad_alloc_orders_are_rejected() {
        assert!(Args::try_parse_from(["page-alloc-bench", "--alloc-orders=zero"]).is_err());
    }
}
