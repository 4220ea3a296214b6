// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Guest signal dispositions and signal sets.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::GuestError;

/// Highest signal number the guest can use.
pub const MAX_SIGNAL: i32 = 64;

/// Handler value meaning "default action".
pub const SIG_DFL: u64 = 0;

/// Handler value meaning "ignore".
pub const SIG_IGN: u64 = 1;

const SIGKILL: i32 = 9;
const SIGSTOP: i32 = 19;

/// A set of guest signals, bit `n - 1` for signal `n`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SigSet(u64);

impl SigSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Set containing only `signo`.
    pub fn single(signo: i32) -> Result<Self, GuestError> {
        Ok(Self(signal_bit(signo)?))
    }

    pub fn contains(&self, signo: i32) -> bool {
        signal_bit(signo).is_ok_and(|bit| self.0 & bit != 0)
    }

    pub fn insert(&mut self, signo: i32) -> Result<(), GuestError> {
        self.0 |= signal_bit(signo)?;
        Ok(())
    }

    pub fn remove(&mut self, signo: i32) -> Result<(), GuestError> {
        self.0 &= !signal_bit(signo)?;
        Ok(())
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Lowest-numbered signal in the set.
    pub fn lowest(&self) -> Option<i32> {
        (self.0 != 0).then(|| self.0.trailing_zeros() as i32 + 1)
    }
}

impl fmt::Debug for SigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigSet({:#018x})", self.0)
    }
}

fn signal_bit(signo: i32) -> Result<u64, GuestError> {
    if !(1..=MAX_SIGNAL).contains(&signo) {
        return Err(GuestError::InvalidSignal { signo });
    }
    Ok(1u64 << (signo - 1))
}

/// How the guest handles one signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDisposition {
    /// Guest address of the handler, or [`SIG_DFL`] / [`SIG_IGN`].
    pub handler: u64,
    pub flags: u64,
    /// Signals blocked while the handler runs.
    pub mask: SigSet,
    pub restorer: u64,
}

impl SignalDisposition {
    pub fn handler(handler: u64) -> Self {
        Self {
            handler,
            ..Self::default()
        }
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Process-wide signal dispositions. Only non-default entries are stored.
#[derive(Debug, Default)]
pub struct SignalTable {
    dispositions: RwLock<BTreeMap<i32, SignalDisposition>>,
}

impl SignalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a disposition, returning the previous one.
    pub fn set(
        &self,
        signo: i32,
        disposition: SignalDisposition,
    ) -> Result<SignalDisposition, GuestError> {
        signal_bit(signo)?;
        if signo == SIGKILL || signo == SIGSTOP {
            return Err(GuestError::InvalidSignal { signo });
        }

        let mut table = self
            .dispositions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = if disposition.is_default() {
            table.remove(&signo)
        } else {
            table.insert(signo, disposition)
        };
        Ok(previous.unwrap_or_default())
    }

    pub fn get(&self, signo: i32) -> Result<SignalDisposition, GuestError> {
        signal_bit(signo)?;
        Ok(self
            .dispositions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&signo)
            .copied()
            .unwrap_or_default())
    }

    /// Copy of every non-default disposition.
    pub fn snapshot(&self) -> BTreeMap<i32, SignalDisposition> {
        self.dispositions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole table.
    pub(crate) fn replace_all(
        &self,
        dispositions: &BTreeMap<i32, SignalDisposition>,
    ) -> Result<(), GuestError> {
        for &signo in dispositions.keys() {
            signal_bit(signo)?;
        }
        *self
            .dispositions
            .write()
            .unwrap_or_else(PoisonError::into_inner) = dispositions.clone();
        Ok(())
    }
}
