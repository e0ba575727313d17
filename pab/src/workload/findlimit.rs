/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Measures how much memory userspace can allocate before the OOM killer
//! steps in.
//!
//! The actual allocating happens in a `findlimit-child` subprocess which
//! prints a running total of faulted-in bytes and is expected to die by
//! SIGKILL. The last total it managed to print is the measurement. Keeping
//! the allocator in a child means the benchmark itself (and sshd, and
//! everything else with a sane oom_score_adj) survives the exercise.

use std::env;
use std::io::BufRead;
use std::io::BufReader;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::debug;
use tracing::info;

use crate::ByteSize;
use crate::sync::Cancellation;

/// Name of the child binary, expected next to the current executable.
pub const CHILD_BIN: &str = "findlimit-child";

#[derive(Debug, Clone)]
pub struct Options {
    /// Size of each anonymous region the child maps per iteration.
    pub alloc_size: ByteSize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            alloc_size: ByteSize::from_mib(256),
        }
    }
}

/// One findlimit measurement.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    /// High-water mark of bytes the child faulted in before being killed.
    pub allocated: ByteSize,
}

fn child_path() -> Result<PathBuf> {
    let exe = env::current_exe().context("getting current executable path")?;
    let dir = exe
        .parent()
        .context("current executable has no parent directory")?;
    Ok(dir.join(CHILD_BIN))
}

/// Run one measurement: spawn the child, let it allocate until the OOM
/// killer takes it, and parse the last total it printed.
///
/// Cancellation kills the child promptly and surfaces as an error.
pub fn run(cancel: &Cancellation, options: &Options) -> Result<Measurement> {
    let path = child_path()?;
    debug!(child = %path.display(), "spawning findlimit child");
    let mut child = Command::new(&path)
        .arg(format!("--alloc-size={}", options.alloc_size.bytes()))
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("spawning {}", path.display()))?;
    let (status, last_line) = supervise(cancel, &mut child)?;

    if cancel.is_cancelled() {
        bail!("findlimit run cancelled");
    }

    let measurement = interpret_exit(status, last_line)?;
    info!(allocated = %measurement.allocated, "findlimit measurement");
    Ok(measurement)
}

/// Drain the child's stdout to EOF (which arrives when the child dies),
/// keeping the last line, then reap it. A watcher thread kills the child if
/// `cancel` fires first.
fn supervise(
    cancel: &Cancellation,
    child: &mut std::process::Child,
) -> Result<(ExitStatus, Option<String>)> {
    let stdout = child.stdout.take().expect("stdout was piped");
    let child_pid = Pid::from_raw(child.id() as i32);

    // The child normally dies on its own; the watcher only matters when the
    // orchestrator wants out early.
    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let done = Arc::clone(&done);
        let cancel = cancel.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                if cancel.is_cancelled() {
                    let _ = kill(child_pid, Signal::SIGKILL);
                    return;
                }
                thread::sleep(Duration::from_millis(20));
            }
        })
    };

    let mut last_line = None;
    for line in BufReader::new(stdout).lines() {
        let line = line.context("reading findlimit child output")?;
        last_line = Some(line);
    }
    let status = child.wait().context("waiting for findlimit child");
    done.store(true, Ordering::Release);
    let _ = watcher.join();
    Ok((status?, last_line))
}

/// Decide what a finished child means. A SIGKILL death with a parseable last
/// line is a measurement; everything else is one of the failure modes.
fn interpret_exit(status: ExitStatus, last_line: Option<String>) -> Result<Measurement> {
    // Check how the child died before parsing its output; a clean exit means
    // it somehow allocated everything it asked for, which is not a
    // measurement.
    match status.signal() {
        Some(signal) if signal == Signal::SIGKILL as i32 => {}
        Some(signal) => bail!(
            "expected findlimit child to be OOM-killed, but it died from signal {}",
            signal
        ),
        None => bail!(
            "expected findlimit child to be OOM-killed, but it exited with status {}",
            status.code().unwrap_or(0)
        ),
    }
    let last_line = last_line.context("findlimit child produced no output")?;
    let allocated: i64 = last_line.trim().parse().with_context(|| {
        format!(
            "parsing last line of findlimit child output ({:?}) as bytes",
            last_line
        )
    })?;
    Ok(Measurement {
        allocated: ByteSize(allocated),
    })
}
