/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The findlimit workload's OOM bait. Maps and faults in anonymous memory as
//! fast as it can, printing a running total of faulted bytes, until the OOM
//! killer takes it out. The parent reads the last total that made it to
//! stdout.

#![deny(clippy::all)]
#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::num::NonZeroUsize;
use std::sync::mpsc;
use std::thread;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::sys::mman::mmap;

/// Continuously allocates blocks of memory and prints how many bytes it has
/// successfully faulted in. Presumably it will eventually get OOM-killed;
/// then you can check the last number it printed.
#[derive(Debug, Parser)]
#[clap(name = "findlimit-child")]
struct Args {
    /// Size in bytes of each anonymous region to map and fault in.
    #[clap(long, value_name = "bytes", default_value_t = 256 * 1024 * 1024)]
    alloc_size: usize,
}

fn main() {
    let args = Args::parse();

    if let Err(err) = run(&args) {
        eprintln!("findlimit child: {:#}", err);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    // Ensure that this process is always the one killed by the OOM killer
    // (assuming nobody else on the system has this oom_score_adj). The
    // parent, sshd and so on get to live.
    fs::write("/proc/self/oom_score_adj", "1000").context("raising oom_score_adj")?;

    let page_size = pab::page_size() as usize;
    let workers = floor_pow2(num_cpus::get());

    // Workers post faulted amounts here; a single printer owns stdout so the
    // faulting threads never serialise on an output lock.
    let (tx, rx) = mpsc::channel::<u64>();
    thread::spawn(move || {
        let mut total: u64 = 0;
        while let Ok(bytes) = rx.recv() {
            total += bytes;
            // Stdout is line buffered, so each total is flushed; whatever
            // line lands last before the SIGKILL is the measurement.
            println!("{}", total);
        }
    });

    loop {
        let region = map_region(args.alloc_size)?;
        fault_in(region, args.alloc_size, workers, page_size, &tx);
        // The region is deliberately never unmapped; holding it is the point.
    }
}

/// Largest power of two not exceeding `n`.
fn floor_pow2(n: usize) -> usize {
    assert!(n > 0);
    1 << (usize::BITS - 1 - n.leading_zeros())
}

fn map_region(len: usize) -> Result<*mut u8> {
    let len = NonZeroUsize::new(len).context("--alloc-size must be nonzero")?;
    // Safety: anonymous mapping, no fd or address hint involved.
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0,
        )
    }
    .with_context(|| format!("mmap({})", len))?;
    Ok(ptr as *mut u8)
}

/// A chunk pointer that may cross into a worker thread. The workers write
/// disjoint chunks of a live mapping, so this is sound.
struct ChunkPtr(*mut u8);
unsafe impl Send for ChunkPtr {}

/// Split the region into one chunk per worker and write one byte per page to
/// fault everything in, posting progress to `tx`.
fn fault_in(region: *mut u8, len: usize, workers: usize, page_size: usize, tx: &mpsc::Sender<u64>) {
    let chunk_size = len / workers;
    thread::scope(|scope| {
        for worker in 0..workers {
            let offset = worker * chunk_size;
            // The last worker picks up any remainder.
            let size = if worker == workers - 1 {
                len - offset
            } else {
                chunk_size
            };
            // Safety: offset < len.
            let chunk = ChunkPtr(unsafe { region.add(offset) });
            let tx = tx.clone();
            scope.spawn(move || {
                let chunk = chunk;
                let mut offset = 0;
                while offset < size {
                    // Safety: within this worker's chunk of a live mapping.
                    // Under THP not every one of these is a real fault; the
                    // resulting overcount is accepted.
                    unsafe { chunk.0.add(offset).write_volatile(0) };
                    let _ = tx.send(page_size as u64);
                    offset += page_size;
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_pow2_values() {
        assert_eq!(floor_pow2(1), 1);
        assert_eq!(floor_pow2(2), 2);
        assert_eq!(floor_pow2(3), 2);
        assert_eq!(floor_pow2(4), 4);
        assert_eq!(floor_pow2(6), 4);
        assert_eq!(floor_pow2(255), 128);
        assert_eq!(floor_pow2(256), 256);
    }

    #[test]
    fn fault_in_posts_every_page() {
        let page_size = pab::page_size() as usize;
        let len = 16 * page_size;
        let region = map_region(len).unwrap();
        let (tx, rx) = mpsc::channel();
        fault_in(region, len, 4, page_size, &tx);
        drop(tx);
        let total: u64 = rx.iter().sum();
        assert_eq!(total, len as u64);
    }

    #[test]
    fn fault_in_covers_unaligned_tails() {
        let page_size = pab::page_size() as usize;
        // Not a multiple of workers * page_size, so chunks start mid-page.
        let len = 7 * page_size;
        let region = map_region(len).unwrap();
        let (tx, rx) = mpsc::channel();
        fault_in(region, len, 4, page_size, &tx);
        drop(tx);
        // Every byte's page gets touched; mid-page chunk boundaries may
        // overcount, which the measurement accepts.
        let total: u64 = rx.iter().sum();
        assert!(total >= len as u64);
    }
}
