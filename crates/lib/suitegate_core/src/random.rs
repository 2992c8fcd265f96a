//! Injectable randomness for token material and load balancing.

use std::sync::Mutex;
use std::sync::PoisonError;

use rand::distr::Alphanumeric;
use rand::{Rng, rng};

/// Source of random values.
pub trait RandomSource: Send + Sync {
    /// Uniform value in `0..upper`. `upper` must be non-zero.
    fn below(&self, upper: u64) -> u64;

    /// Random alphanumeric string of `len` characters.
    fn alphanumeric(&self, len: usize) -> String;
}

/// Thread-local CSPRNG (`rand::rng()`).
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn below(&self, upper: u64) -> u64 {
        rng().random_range(0..upper.max(1))
    }

    fn alphanumeric(&self, len: usize) -> String {
        rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }
}

/// Replays a fixed sequence of values. Strings are the reversed decimal digits
/// of the next value, so consecutive calls differ in their first character.
#[derive(Debug)]
pub struct SequenceRandom {
    values: Vec<u64>,
    cursor: Mutex<usize>,
}

impl SequenceRandom {
    pub fn new(values: Vec<u64>) -> Self {
        Self {
            values,
            cursor: Mutex::new(0),
        }
    }

    fn next(&self) -> u64 {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let value = if self.values.is_empty() {
            *cursor as u64
        } else {
            self.values[*cursor % self.values.len()]
        };
        *cursor += 1;
        value
    }
}

impl RandomSource for SequenceRandom {
    fn below(&self, upper: u64) -> u64 {
        self.next() % upper.max(1)
    }

    fn alphanumeric(&self, len: usize) -> String {
        let digits: String = format!("{:020}", self.next()).chars().rev().collect();
        digits.chars().cycle().take(len).collect()
    }
}
