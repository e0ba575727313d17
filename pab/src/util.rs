/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Widely useful small utilities.

use std::fmt;

/// The system page size in bytes.
pub fn page_size() -> i64 {
    // _SC_PAGE_SIZE cannot fail on Linux.
    match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) => size,
        _ => 4096,
    }
}

/// A quantity of memory in bytes. Signed so that differences of measurements
/// are representable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub i64);

impl ByteSize {
    pub const KIB: ByteSize = ByteSize(1024);
    pub const MIB: ByteSize = ByteSize(1024 * 1024);
    pub const GIB: ByteSize = ByteSize(1024 * 1024 * 1024);

    /// A quantity of `n` mebibytes.
    pub const fn from_mib(n: i64) -> ByteSize {
        ByteSize(n * Self::MIB.0)
    }

    pub fn bytes(self) -> i64 {
        self.0
    }

    /// How many whole system pages this quantity covers.
    pub fn pages(self) -> i64 {
        self.0 / page_size()
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let abs = self.0.abs();
        if abs < Self::KIB.0 {
            write!(f, "{}B", self.0)
        } else if abs < Self::MIB.0 {
            write!(f, "{:.2}KiB", self.0 as f64 / Self::KIB.0 as f64)
        } else if abs < Self::GIB.0 {
            write!(f, "{:.2}MiB", self.0 as f64 / Self::MIB.0 as f64)
        } else {
            write!(f, "{:.2}GiB", self.0 as f64 / Self::GIB.0 as f64)
        }
    }
}

impl std::ops::Add for ByteSize {
    type Output = ByteSize;
    fn add(self, rhs: ByteSize) -> ByteSize {
        ByteSize(self.0 + rhs.0)
    }
}

impl std::ops::Sub for ByteSize {
    type Output = ByteSize;
    fn sub(self, rhs: ByteSize) -> ByteSize {
        ByteSize(self.0 - rhs.0)
    }
}

impl std::ops::Mul<i64> for ByteSize {
    type Output = ByteSize;
    fn mul(self, rhs: i64) -> ByteSize {
        ByteSize(self.0 * rhs)
    }
}

/// A LIFO registry of cleanup actions, run in reverse registration order when
/// dropped (or explicitly via [`Cleanups::run`]).
#[derive(Default)]
pub struct Cleanups {
    actions: Vec<Box<dyn FnOnce() + Send>>,
}

impl Cleanups {
    /// Register a cleanup action. Actions run in reverse registration order.
    pub fn push(&mut self, action: impl FnOnce() + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Run (and consume) all registered actions now.
    pub fn run(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

impl Drop for Cleanups {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Cleanups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cleanups({} pending)", self.actions.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn bytesize_display() {
        assert_eq!(ByteSize(123).to_string(), "123B");
        assert_eq!(ByteSize(1536).to_string(), "1.50KiB");
        assert_eq!(ByteSize::from_mib(256).to_string(), "256.00MiB");
        assert_eq!((ByteSize::GIB * 2).to_string(), "2.00GiB");
        assert_eq!(ByteSize(-42).to_string(), "-42B");
    }

    #[test]
    fn bytesize_pages() {
        let page = page_size();
        assert_eq!(ByteSize(page * 10).pages(), 10);
        assert_eq!(ByteSize(page * 10 + 1).pages(), 10);
        assert_eq!(ByteSize(0).pages(), 0);
    }

    #[test]
    fn cleanups_run_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut cleanups = Cleanups::default();
        for i in 0..3 {
            let order = Arc::clone(&order);
            cleanups.push(move || order.lock().unwrap().push(i));
        }
        drop(cleanups);
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn cleanups_run_is_idempotent() {
        let count = Arc::new(Mutex::new(0));
        let mut cleanups = Cleanups::default();
        {
            let count = Arc::clone(&count);
            cleanups.push(move || *count.lock().unwrap() += 1);
        }
        cleanups.run();
        cleanups.run();
        drop(cleanups);
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
