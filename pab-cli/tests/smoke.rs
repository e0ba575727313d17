/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end smoke tests. These drive the real binary against the real
//! kernel module and repeatedly OOM the host, so they are ignored by
//! default; run them with `cargo test -- --ignored` on a machine set up
//! (and expendable) for it.

use std::process::Command;

/// A one-order, one-iteration composite run, bounded by a timeout.
#[test]
#[ignore]
fn composite_produces_schema_conformant_json() {
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("results.json");

    let status = Command::new(env!("CARGO_BIN_EXE_page-alloc-bench"))
        .arg("--alloc-orders=0")
        .arg("--iterations=1")
        .arg("--timeout-s=300")
        .arg(format!("--output-path={}", output_path.display()))
        .status()
        .unwrap();
    assert!(status.success());

    let parsed: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&output_path).unwrap()).unwrap();
    let object = parsed.as_object().unwrap();
    for key in [
        "idle_available_bytes_order0",
        "antagonized_available_bytes_order0",
        "kernel_page_allocs_order0",
        "kernel_page_allocs_remote_order0",
        "kernel_alloc_failures_order0",
        "kernel_page_alloc_latencies_ns_order0",
    ] {
        let values = object[key].as_array().unwrap();
        assert!(!values.is_empty(), "{} is empty", key);
        assert!(values.iter().all(serde_json::Value::is_i64));
    }
    // A healthy run allocates plenty and frees everything it allocated.
    assert!(object["kernel_page_allocs_order0"][0].as_i64().unwrap() > 0);
}

/// The findlimit child on its own: it must die by OOM, not exit.
#[test]
#[ignore]
fn findlimit_child_gets_oom_killed() {
    use std::os::unix::process::ExitStatusExt;

    let status = Command::new(env!("CARGO_BIN_EXE_findlimit-child"))
        .status()
        .unwrap();
    assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGKILL as i32));
}
