/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The two workloads the composite benchmark composes: [`kallocfree`] hammers
//! the kernel page allocator from every CPU, [`findlimit`] measures how much
//! memory userspace can still get its hands on.

pub mod findlimit;
pub mod kallocfree;
