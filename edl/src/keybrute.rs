// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Phased key search for firmware whose (key, iv) isn't in the template
//! tables. All phases drive the same try-key oracle (usually
//! [`crate::ofp::ProfileProbe::try_pair`]); the phases get progressively
//! less informed and a wall-clock budget bounds the whole run.

use std::time::{Duration, Instant};

use log::{debug, info};
use rand::RngCore;

use crate::ofp::{AesPair, KEY_TEMPLATES, KeyTemplate, derive_pair};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrutePhase {
    /// Last-byte variations of the known obfuscated tuples.
    Variant,
    /// Last-byte variations of the known simple pairs.
    Simple,
    /// Sliding hexadecimal patterns.
    Incremental,
    /// Uniformly random material.
    Random,
}

#[derive(Debug, Clone)]
pub struct BruteForceOpts {
    pub time_limit: Duration,
    pub incremental_cap: u64,
    pub random_tries: u64,
}

impl Default for BruteForceOpts {
    fn default() -> Self {
        BruteForceOpts {
            time_limit: Duration::from_secs(600),
            incremental_cap: 10_000,
            random_tries: 5_000,
        }
    }
}

#[derive(Debug)]
pub struct BruteForceOutcome {
    pub found: Option<AesPair>,
    pub tried: u64,
    pub elapsed: Duration,
    /// Which phase produced the hit, if any.
    pub phase: Option<BrutePhase>,
}

/// Progress callback: `(tries_so_far, current_phase)`.
pub type BruteProgressFn<'a> = &'a mut dyn FnMut(u64, BrutePhase);

const PATTERNS: &[&str] = &[
    "0123456789ABCDEF",
    "FEDCBA9876543210",
    "0123456789abcdef",
    "fedcba9876543210",
    "0000000011111111",
    "A5A5A5A5A5A5A5A5",
];

struct Search<'a, 'b> {
    oracle: &'a mut dyn FnMut(&AesPair) -> bool,
    progress: Option<BruteProgressFn<'b>>,
    deadline: Instant,
    tried: u64,
    found: Option<(AesPair, BrutePhase)>,
}

impl Search<'_, '_> {
    /// Returns `true` when the search should stop (hit or out of time).
    fn attempt(&mut self, pair: &AesPair, phase: BrutePhase, report_every: u64) -> bool {
        self.tried += 1;
        if (self.oracle)(pair) {
            info!("key search hit after {} tries ({:?} phase)", self.tried, phase);
            self.found = Some((*pair, phase));
            return true;
        }
        if self.tried % report_every == 0 {
            if let Some(cb) = self.progress.as_mut() {
                cb(self.tried, phase);
            }
        }
        Instant::now() >= self.deadline
    }
}

/// Run the four phases until the oracle accepts, the wall clock runs out, or
/// every candidate is spent.
pub fn brute_force(
    oracle: &mut dyn FnMut(&AesPair) -> bool,
    opts: &BruteForceOpts,
    progress: Option<BruteProgressFn<'_>>,
) -> BruteForceOutcome {
    let started = Instant::now();
    let mut search = Search {
        oracle,
        progress,
        deadline: started + opts.time_limit,
        tried: 0,
        found: None,
    };

    let done = phase_variant(&mut search)
        || phase_simple(&mut search)
        || phase_incremental(&mut search, opts.incremental_cap)
        || phase_random(&mut search, opts.random_tries);
    let _ = done;

    let (found, phase) = match search.found {
        Some((pair, phase)) => (Some(pair), Some(phase)),
        None => (None, None),
    };
    debug!(
        "key search over: {} tries in {:?}",
        search.tried,
        started.elapsed()
    );
    BruteForceOutcome {
        found,
        tried: search.tried,
        elapsed: started.elapsed(),
        phase,
    }
}

/// Phase 1: each obfuscated tuple, varying the last byte of mc, userkey and
/// ivec independently, then the high nibbles of (userkey, ivec) crosswise.
fn phase_variant(s: &mut Search<'_, '_>) -> bool {
    for template in KEY_TEMPLATES {
        let Some((mc, userkey, ivec)) = template.tuple_bytes() else {
            continue;
        };

        for field in 0..3 {
            for v in 0..=255u8 {
                let (mut mc, mut userkey, mut ivec) =
                    (mc.clone(), userkey.clone(), ivec.clone());
                let target = match field {
                    0 => &mut mc,
                    1 => &mut userkey,
                    _ => &mut ivec,
                };
                *target.last_mut().expect("nonempty tuple part") = v;
                let pair = derive_pair(&mc, &userkey, &ivec);
                if s.attempt(&pair, BrutePhase::Variant, 100) {
                    return true;
                }
            }
        }

        // Crosswise high nibbles of the last userkey/ivec bytes
        let (mut userkey, mut ivec) = (userkey.clone(), ivec.clone());
        let (uk_last, iv_last) = (userkey.len() - 1, ivec.len() - 1);
        let (uk_low, iv_low) = (userkey[uk_last] & 0x0F, ivec[iv_last] & 0x0F);
        for a in 0..16u8 {
            for b in 0..16u8 {
                userkey[uk_last] = (a << 4) | uk_low;
                ivec[iv_last] = (b << 4) | iv_low;
                let pair = derive_pair(&mc, &userkey, &ivec);
                if s.attempt(&pair, BrutePhase::Variant, 100) {
                    return true;
                }
            }
        }
    }
    false
}

/// Phase 2: last-byte variation over the simple 16-char pairs.
fn phase_simple(s: &mut Search<'_, '_>) -> bool {
    for template in KEY_TEMPLATES {
        let KeyTemplate::Simple { key, iv } = template else {
            continue;
        };
        let base = AesPair {
            key: key.as_bytes().try_into().expect("16-char key"),
            iv: iv.as_bytes().try_into().expect("16-char iv"),
        };

        for v in 0..=255u8 {
            let mut pair = base;
            pair.key[15] = v;
            if s.attempt(&pair, BrutePhase::Simple, 100) {
                return true;
            }
            let mut pair = base;
            pair.iv[15] = v;
            if s.attempt(&pair, BrutePhase::Simple, 100) {
                return true;
            }
        }
    }
    false
}

/// Phase 3: hex patterns slid against themselves, key offsets crossed with
/// iv offsets, bounded by `cap`.
fn phase_incremental(s: &mut Search<'_, '_>, cap: u64) -> bool {
    let mut budget = cap;
    for key_pat in PATTERNS {
        for key_off in 0..16usize {
            let key = rotate_pattern(key_pat, key_off);
            for iv_pat in PATTERNS {
                for iv_off in 0..16usize {
                    if budget == 0 {
                        return false;
                    }
                    budget -= 1;
                    let pair = AesPair {
                        key,
                        iv: rotate_pattern(iv_pat, iv_off),
                    };
                    if s.attempt(&pair, BrutePhase::Incremental, 500) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

fn rotate_pattern(pattern: &str, offset: usize) -> [u8; 16] {
    let bytes = pattern.as_bytes();
    let mut out = [0u8; 16];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = bytes[(i + offset) % bytes.len()];
    }
    out
}

/// Phase 4: uniformly random 16-byte keys and IVs.
fn phase_random(s: &mut Search<'_, '_>, tries: u64) -> bool {
    let mut rng = rand::thread_rng();
    for _ in 0..tries {
        let mut pair = AesPair {
            key: [0; 16],
            iv: [0; 16],
        };
        rng.fill_bytes(&mut pair.key);
        rng.fill_bytes(&mut pair.iv);
        if s.attempt(&pair, BrutePhase::Random, 500) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_a_last_byte_variant_early() {
        // Target: the first tuple template with its ivec last byte changed
        let (mc, userkey, mut ivec) = KEY_TEMPLATES[0].tuple_bytes().unwrap();
        let last = ivec.len() - 1;
        ivec[last] = ivec[last].wrapping_add(7);
        let target = derive_pair(&mc, &userkey, &ivec);

        let mut oracle = |pair: &AesPair| *pair == target;
        let outcome = brute_force(&mut oracle, &BruteForceOpts::default(), None);
        assert_eq!(outcome.found, Some(target));
        assert_eq!(outcome.phase, Some(BrutePhase::Variant));
        assert!(outcome.tried > 0);
    }

    #[test]
    fn exhausts_within_the_caps_when_nothing_matches() {
        let opts = BruteForceOpts {
            time_limit: Duration::from_secs(30),
            incremental_cap: 200,
            random_tries: 50,
        };
        let mut calls = 0u64;
        let mut oracle = |_: &AesPair| {
            calls += 1;
            false
        };
        let outcome = brute_force(&mut oracle, &opts, None);
        assert!(outcome.found.is_none());
        assert_eq!(outcome.tried, calls);
    }

    #[test]
    fn progress_fires_on_the_phase_cadence() {
        let opts = BruteForceOpts {
            time_limit: Duration::from_secs(30),
            incremental_cap: 0,
            random_tries: 0,
        };
        let mut reports: Vec<u64> = Vec::new();
        let mut progress = |tries: u64, _phase: BrutePhase| reports.push(tries);
        let mut oracle = |_: &AesPair| false;
        brute_force(&mut oracle, &opts, Some(&mut progress));
        assert!(!reports.is_empty());
        assert!(reports.iter().all(|t| t % 100 == 0 || t % 500 == 0));
    }

    #[test]
    fn incremental_patterns_are_ascii_hex() {
        let key = rotate_pattern("0123456789ABCDEF", 5);
        assert_eq!(&key, b"56789ABCDEF01234");
    }
}
