/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Core library for page_alloc_bench, a benchmark that drives the kernel's
//! page allocator from every CPU and measures how that degrades the memory
//! available to userspace.
//!
//! The pieces, leaves-up: [`linux`] wraps the raw syscall surfaces, [`kmod`]
//! speaks the benchmark kernel module's ioctl protocol, [`sampling`] keeps
//! bounded latency samples, [`sync`] has the cancellation and signalling
//! primitives, and [`workload`] contains the two workloads the composite
//! benchmark composes.

#![deny(clippy::all)]
#![allow(clippy::uninlined_format_args)]

pub mod kmod;
pub mod linux;
pub mod sampling;
pub mod sync;
pub mod util;
pub mod workload;

pub use anyhow::Context;
pub use anyhow::Error;
pub use util::ByteSize;
pub use util::Cleanups;
pub use util::page_size;
