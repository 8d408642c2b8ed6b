// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.

use std::ops::Add;
use std::ops::BitAnd;
use std::ops::Not;
use std::ops::Sub;

/// Rounds `x` up to the next multiple of `alignment`, which must be a power of two.
pub fn align_up<T>(x: T, alignment: T) -> T
where
    T: Add<Output = T> + Sub<Output = T> + BitAnd<Output = T> + Not<Output = T> + From<u8> + Copy,
{
    let one = T::from(1u8);
    (x + alignment - one) & !(alignment - one)
}

/// A rational time base, expressed in seconds per tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timebase {
    pub num: i64,
    pub den: i64,
}

impl Timebase {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Whether this time base can be used to rescale timestamps.
    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }
}

/// Time base of the timestamps reported by the accelerator (100ns ticks).
pub const DEVICE_TIMEBASE: Timebase = Timebase::new(1, 10_000_000);

/// Rescales `ts` from time base `from` to time base `to`, rounding to the nearest tick with ties
/// away from zero.
pub fn rescale_ts(ts: i64, from: Timebase, to: Timebase) -> i64 {
    if !from.is_valid() || !to.is_valid() {
        return ts;
    }

    let num = ts as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    let half = den / 2;
    let rounded = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };

    rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
