/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reservoir sampling: a fixed-capacity uniform random sample of a stream.
//!
//! This is Algorithm R, see
//! <https://en.wikipedia.org/wiki/Reservoir_sampling#Simple:_Algorithm_R>.

use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// A bounded uniform sample of a stream of observations.
///
/// Single-writer: one thread feeds [`Reservoir::add`]; read the result only
/// after that writer has quiesced. The PRNG is seeded by the caller so a
/// given build replays the same sampling trajectory run to run.
#[derive(Debug)]
pub struct Reservoir<T> {
    samples: Vec<T>,
    capacity: usize,
    seen: usize,
    rng: Pcg64Mcg,
}

impl<T> Reservoir<T> {
    /// A reservoir keeping at most `capacity` samples, with a deterministic
    /// sampling trajectory derived from `seed` (callers seed per-CPU from the
    /// CPU id).
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            samples: Vec::new(),
            capacity,
            seen: 0,
            rng: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    /// Offer the next stream item to the reservoir.
    pub fn add(&mut self, item: T) {
        let index = self.seen;
        self.seen += 1;
        // Until the reservoir is full, every input is kept.
        if self.samples.len() < self.capacity {
            self.samples.push(item);
            return;
        }
        // Afterwards, item i replaces a random slot with probability K/(i+1).
        let slot = self.rng.gen_range(0..=index);
        if slot < self.capacity {
            self.samples[slot] = item;
        }
    }

    /// The current sample: a uniformly random subset of the stream seen so
    /// far, of size `min(seen, capacity)`. Read-only.
    pub fn samples(&self) -> &[T] {
        &self.samples
    }

    /// Consume the reservoir, yielding its samples.
    pub fn into_samples(self) -> Vec<T> {
        self.samples
    }

    /// How many stream items have been offered in total.
    pub fn seen(&self) -> usize {
        self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_stream_is_kept_verbatim() {
        let mut reservoir = Reservoir::new(10, 0);
        for i in 0..5 {
            reservoir.add(i);
        }
        assert_eq!(reservoir.samples(), &[0, 1, 2, 3, 4]);
        assert_eq!(reservoir.seen(), 5);
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let mut reservoir = Reservoir::new(8, 1);
        for i in 0..1000 {
            reservoir.add(i);
            assert_eq!(reservoir.samples().len(), (i + 1).min(8));
        }
        assert_eq!(reservoir.seen(), 1000);
    }

    #[test]
    fn same_seed_same_trajectory() {
        let mut a = Reservoir::new(16, 42);
        let mut b = Reservoir::new(16, 42);
        for i in 0..10_000 {
            a.add(i);
            b.add(i);
        }
        assert_eq!(a.samples(), b.samples());
    }

    #[test]
    fn different_seeds_differ() {
        let mut a = Reservoir::new(16, 1);
        let mut b = Reservoir::new(16, 2);
        for i in 0..10_000 {
            a.add(i);
            b.add(i);
        }
        assert_ne!(a.samples(), b.samples());
    }

    #[test]
    fn samples_are_roughly_uniform() {
        // Over many seeds, each stream index should be retained with
        // frequency close to K/N.
        const K: usize = 32;
        const N: usize = 1024;
        const RUNS: u64 = 2000;
        let mut hits = vec![0u32; N];
        for seed in 0..RUNS {
            let mut reservoir = Reservoir::new(K, seed);
            for i in 0..N {
                reservoir.add(i);
            }
            for &kept in reservoir.samples() {
                hits[kept] += 1;
            }
        }
        let expected = RUNS as f64 * K as f64 / N as f64; // 62.5
        for (index, &count) in hits.iter().enumerate() {
            let frequency = count as f64;
            // Loose statistical tolerance; the point is no index is starved
            // or systematically favored.
            assert!(
                frequency > expected * 0.3 && frequency < expected * 2.5,
                "index {} kept {} times, expected about {:.1}",
                index,
                count,
                expected
            );
        }
    }
}
