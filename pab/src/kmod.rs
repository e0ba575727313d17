/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Client for the benchmark's kernel module.
//!
//! The module exposes `/proc/page_alloc_bench` and speaks the ioctl protocol
//! declared in `kmod/page_alloc_bench.h`. The request codes below are derived
//! with the same `_IOWR`/`_IOR` arithmetic the header uses, so they track
//! struct sizes rather than hard-coding pointer-width constants.

use std::fs::File;
use std::fs::OpenOptions;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use nix::request_code_read;
use nix::request_code_readwrite;

use crate::linux;

/// Path of the procfs node the kernel module registers.
pub const PROCFS_PATH: &str = "/proc/page_alloc_bench";

const PAB_IOCTL_BASE: u8 = 0x12;

// Layouts mirror `kmod/page_alloc_bench.h` field for field.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct AllocPageArgs {
    order: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct AllocPageResult {
    id: u64,
    nid: i32,
    latency_ns: i64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct IoctlAllocPage {
    args: AllocPageArgs,
    result: AllocPageResult,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FreePageArgs {
    id: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FreePageResult {
    latency_ns: i64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct IoctlFreePage {
    args: FreePageArgs,
    result: FreePageResult,
}

const PAB_IOCTL_ALLOC_PAGE: libc::c_ulong =
    request_code_readwrite!(PAB_IOCTL_BASE, 1, mem::size_of::<IoctlAllocPage>()) as libc::c_ulong;
// The legacy free command takes the raw id as the ioctl argument; its size
// field is the pointer the original interface declared.
const PAB_IOCTL_FREE_PAGE_LEGACY: libc::c_ulong =
    request_code_read!(PAB_IOCTL_BASE, 2, mem::size_of::<*mut libc::c_void>()) as libc::c_ulong;
const PAB_IOCTL_FREE_PAGE: libc::c_ulong =
    request_code_readwrite!(PAB_IOCTL_BASE, 3, mem::size_of::<IoctlFreePage>()) as libc::c_ulong;

/// A page block allocated by the kernel module.
///
/// `id` is opaque (spoiler: it is the kernel's `struct page *`) and must be
/// handed back verbatim, exactly once, to free the block.
#[derive(Debug)]
pub struct Page {
    pub(crate) id: u64,
    /// NUMA node the block came from, or -1 if indeterminate.
    pub nid: i32,
    /// In-kernel allocation latency, excluding syscall overhead.
    pub latency: Duration,
    /// The order the block was requested at.
    pub order: u32,
}

/// The allocation surface the kallocfree workload drives. The kernel module
/// is the real implementation; tests substitute error-injecting fakes here.
pub trait PageAllocator: Sync {
    /// Allocate a 2^order-page block. ENOMEM is the transient-failure errno.
    fn alloc_page(&self, order: u32) -> nix::Result<Page>;

    /// Free a block previously returned by [`PageAllocator::alloc_page`].
    /// Returns the in-kernel free latency when the interface reports one.
    fn free_page(&self, page: &Page) -> nix::Result<Option<Duration>>;
}

/// A connection to the loaded kernel module.
#[derive(Debug)]
pub struct Connection {
    file: File,
    legacy_free: bool,
}

impl Connection {
    /// Open the module's procfs node. `legacy_free` selects the historical
    /// FREE_PAGE interface for older module builds (raw id, no latency).
    pub fn open(legacy_free: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(PROCFS_PATH)
            .with_context(|| format!("opening {} (is the module loaded?)", PROCFS_PATH))?;
        Ok(Self { file, legacy_free })
    }
}

impl PageAllocator for Connection {
    fn alloc_page(&self, order: u32) -> nix::Result<Page> {
        let mut ioctl = IoctlAllocPage {
            args: AllocPageArgs {
                order: order as i32,
            },
            ..Default::default()
        };
        // Safety: the struct outlives the call and matches the request's size.
        unsafe {
            linux::ioctl(
                self.file.as_raw_fd(),
                PAB_IOCTL_ALLOC_PAGE,
                &mut ioctl as *mut IoctlAllocPage as libc::c_ulong,
            )?;
        }
        Ok(Page {
            id: ioctl.result.id,
            nid: ioctl.result.nid,
            latency: Duration::from_nanos(ioctl.result.latency_ns.max(0) as u64),
            order,
        })
    }

    fn free_page(&self, page: &Page) -> nix::Result<Option<Duration>> {
        if self.legacy_free {
            // Safety: the argument is an immediate value, not a pointer.
            unsafe {
                linux::ioctl(
                    self.file.as_raw_fd(),
                    PAB_IOCTL_FREE_PAGE_LEGACY,
                    page.id as libc::c_ulong,
                )?;
            }
            return Ok(None);
        }

        let mut ioctl = IoctlFreePage {
            args: FreePageArgs { id: page.id },
            ..Default::default()
        };
        // Safety: the struct outlives the call and matches the request's size.
        unsafe {
            linux::ioctl(
                self.file.as_raw_fd(),
                PAB_IOCTL_FREE_PAGE,
                &mut ioctl as *mut IoctlFreePage as libc::c_ulong,
            )?;
        }
        Ok(Some(Duration::from_nanos(
            ioctl.result.latency_ns.max(0) as u64
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The ioctl structs cross the user/kernel boundary; their layout is ABI.
    #[test]
    fn ioctl_struct_layout() {
        assert_eq!(mem::size_of::<IoctlAllocPage>(), 32);
        assert_eq!(mem::offset_of!(IoctlAllocPage, result), 8);
        assert_eq!(mem::size_of::<IoctlFreePage>(), 16);
        assert_eq!(mem::offset_of!(IoctlFreePage, result), 8);
    }

    #[test]
    fn request_codes_match_header_derivation() {
        // _IOC_TYPE / _IOC_NR / _IOC_SIZE decomposition of the codes.
        fn nr(code: libc::c_ulong) -> u64 {
            (code & 0xff) as u64
        }
        fn ty(code: libc::c_ulong) -> u64 {
            ((code >> 8) & 0xff) as u64
        }
        fn size(code: libc::c_ulong) -> u64 {
            ((code >> 16) & 0x3fff) as u64
        }
        assert_eq!(ty(PAB_IOCTL_ALLOC_PAGE), 0x12);
        assert_eq!(nr(PAB_IOCTL_ALLOC_PAGE), 1);
        assert_eq!(size(PAB_IOCTL_ALLOC_PAGE), 32);
        assert_eq!(ty(PAB_IOCTL_FREE_PAGE_LEGACY), 0x12);
        assert_eq!(nr(PAB_IOCTL_FREE_PAGE_LEGACY), 2);
        assert_eq!(size(PAB_IOCTL_FREE_PAGE_LEGACY), 8);
        assert_eq!(ty(PAB_IOCTL_FREE_PAGE), 0x12);
        assert_eq!(nr(PAB_IOCTL_FREE_PAGE), 3);
        assert_eq!(size(PAB_IOCTL_FREE_PAGE), 16);
    }

    /// Requires the kernel module to be loaded; exercises a real alloc/free.
    #[test]
    #[ignore]
    fn alloc_and_free_order_zero() {
        let conn = Connection::open(false).unwrap();
        let page = conn.alloc_page(0).unwrap();
        assert!(page.nid >= -1);
        let latency = conn.free_page(&page).unwrap();
        assert!(latency.is_some());
    }
}
