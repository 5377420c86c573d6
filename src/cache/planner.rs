//! Capacity planning.
//!
//! Splits one memory budget across the named caches by relative weight and
//! converts each share into an entry count using a per-entry size estimate.
//! A negative weight is a literal capacity override and does not take part
//! in the proportional split.

use std::collections::BTreeMap;
use std::fmt;
use std::mem::size_of;

use thiserror::Error;

use super::keys::{Cacheable, Lookup};

/// Average hash-table slot cost per stored entry at a typical load factor.
pub const EMPTY_BUCKET_OVERHEAD: f64 = 10.79;

/// LRU node bookkeeping: key and value pointers plus list links.
pub const ELEMENT_OVERHEAD: usize = 4 * size_of::<usize>();

/// Serialised secondary-index key estimate (two identifiers).
const INDEX_KEY_BYTES: usize = 2 * 36;

/// Per-value wrapper kept alongside every cached value (slot id and key list header).
const INDEX_WRAPPER_BYTES: usize = size_of::<u64>() + size_of::<Vec<()>>();

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("cache `{cache}` has a non-finite weight")]
    NonFiniteWeight { cache: &'static str },
    #[error("cache `{cache}` has a zero per-entry size")]
    ZeroEntrySize { cache: &'static str },
}

/// Estimated memory cost of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntrySize {
    pub key_bytes: usize,
    pub value_bytes: usize,
}

impl EntrySize {
    pub fn new(key_bytes: usize, value_bytes: usize) -> Self {
        Self {
            key_bytes,
            value_bytes,
        }
    }

    /// Cost of a value reachable under `lookups` secondary indices.
    pub fn indexed(value_bytes: usize, lookups: usize) -> Self {
        Self {
            key_bytes: size_of::<u64>() + lookups * INDEX_KEY_BYTES,
            value_bytes: value_bytes + lookups * size_of::<u64>() + INDEX_WRAPPER_BYTES,
        }
    }

    /// Cost of one entry in a multi-index cache of `T`.
    pub fn of<T: Cacheable>() -> Self {
        Self::indexed(T::estimated_size(), T::Lookup::all().len())
    }

    fn total(&self) -> usize {
        self.key_bytes + self.value_bytes
    }
}

/// One cache to size.
#[derive(Debug, Clone, Copy)]
pub struct CacheRequest {
    pub name: &'static str,
    pub weight: f64,
    pub size: EntrySize,
}

impl CacheRequest {
    pub fn new(name: &'static str, weight: f64, size: EntrySize) -> Self {
        Self { name, weight, size }
    }
}

/// Derives cache capacities from a memory budget.
#[derive(Debug, Clone, Copy)]
pub struct CapacityPlanner {
    budget_bytes: u64,
    entry_overhead: f64,
}

impl CapacityPlanner {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            entry_overhead: EMPTY_BUCKET_OVERHEAD + ELEMENT_OVERHEAD as f64,
        }
    }

    /// Replace the fixed per-entry bookkeeping overhead.
    pub fn with_entry_overhead(mut self, overhead: f64) -> Self {
        self.entry_overhead = overhead.max(0.0);
        self
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn plan<I>(&self, requests: I) -> Result<CapacityPlan, PlanError>
    where
        I: IntoIterator<Item = CacheRequest>,
    {
        let requests: Vec<CacheRequest> = requests.into_iter().collect();

        for request in &requests {
            if !request.weight.is_finite() {
                return Err(PlanError::NonFiniteWeight {
                    cache: request.name,
                });
            }
        }

        let total_weight: f64 = requests
            .iter()
            .map(|request| request.weight)
            .filter(|weight| *weight > 0.0)
            .sum();

        let mut capacities = BTreeMap::new();
        for request in &requests {
            let capacity = if request.weight < 0.0 {
                (-request.weight).floor() as usize
            } else if request.weight == 0.0 || total_weight == 0.0 {
                0
            } else {
                let per_entry = request.size.total() as f64 + self.entry_overhead;
                if per_entry <= 0.0 {
                    return Err(PlanError::ZeroEntrySize {
                        cache: request.name,
                    });
                }
                let share = self.budget_bytes as f64 * (request.weight / total_weight);
                (share / per_entry).floor() as usize
            };
            capacities.insert(request.name, capacity);
        }

        Ok(CapacityPlan { capacities })
    }
}

/// Resolved capacity per cache name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapacityPlan {
    capacities: BTreeMap<&'static str, usize>,
}

impl CapacityPlan {
    /// Capacity for `name`, zero when the cache was not planned.
    pub fn capacity(&self, name: &str) -> usize {
        self.capacities.get(name).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, usize)> + '_ {
        self.capacities
            .iter()
            .map(|(name, capacity)| (*name, *capacity))
    }

    pub fn len(&self) -> usize {
        self.capacities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capacities.is_empty()
    }
}

impl fmt::Display for CapacityPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapacityPlan {{")?;
        for (idx, (name, capacity)) in self.capacities.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, " {name}: {capacity}")?;
        }
        write!(f, " }}")
    }
}
