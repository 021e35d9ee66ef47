//! Shared immutable frequency-domain grids.
//!
//! Frequency grids, gamma fields and pupils depend only on their defining
//! parameters, so concurrent runs with identical parameters share one copy.
//! Floating parameters are keyed by bit pattern: a hit needs an exact match.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::Result;
use crate::gamma::{EvanescentPolicy, GammaField};
use crate::grid::{Cutoff, FrequencyGrid, Grid, Medium};
use crate::pupil::PupilMask;

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn identical_parameters_share() {
        let cache = GridCache::new();
        let grid = Grid::new((8, 8), [0.1, 0.1, 0.1]).unwrap();
        let medium = Medium::new(1.33, 0.5).unwrap();

        let a = cache.gamma(&grid, &medium, EvanescentPolicy::Clamp, Cutoff::Inclusive).unwrap();
        let b = cache.gamma(&grid, &medium, EvanescentPolicy::Clamp, Cutoff::Inclusive).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = cache.gamma(&grid, &medium, EvanescentPolicy::Decay, Cutoff::Inclusive).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        let p = cache.pupil(&grid, 0.5, &medium, Cutoff::Inclusive).unwrap();
        let q = cache.pupil(&grid, 0.5, &medium, Cutoff::Inclusive).unwrap();
        assert!(Arc::ptr_eq(&p, &q));
        assert_eq!(cache.len(), 4); // frequency grid, two gamma fields, one pupil
    }

    #[test]
    fn nearby_parameters_miss() {
        let cache = GridCache::new();
        let grid = Grid::new((8, 8), [0.1, 0.1, 0.1]).unwrap();
        let shifted = Grid::new((8, 8), [0.1 + 1e-15, 0.1, 0.1]).unwrap();
        let a = cache.frequency_grid(&grid);
        let b = cache.frequency_grid(&shifted);
        assert!(!Arc::ptr_eq(&a, &b));

        let medium = Medium::new(1.33, 0.5).unwrap();
        let p = cache.pupil(&grid, 0.5, &medium, Cutoff::Inclusive).unwrap();
        let q = cache.pupil(&grid, 0.5, &Medium::new(1.34, 0.5).unwrap(), Cutoff::Inclusive).unwrap();
        assert!(!Arc::ptr_eq(&p, &q));
    }

    #[test]
    fn usable_across_threads() {
        use rayon::prelude::*;

        let cache = GridCache::new();
        let grid = Grid::new((16, 16), [0.1, 0.1, 0.1]).unwrap();
        let fields: Vec<Arc<GammaField>> = (0..8)
            .into_par_iter()
            .map(|_| {
                cache
                    .gamma(&grid, &Medium::default(), EvanescentPolicy::Clamp, Cutoff::Inclusive)
                    .unwrap()
            })
            .collect();
        assert!(fields.iter().all(|f| **f == *fields[0]));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GridKey {
    shape: (usize, usize),
    res: [u64; 3],
}

impl From<&Grid> for GridKey {
    fn from(grid: &Grid) -> Self {
        Self {
            shape: grid.shape,
            res: grid.res.as_array().map(f64::to_bits),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GammaKey {
    grid: GridKey,
    n0: u64,
    wavelength: u64,
    policy: EvanescentPolicy,
    cutoff: Cutoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PupilKey {
    grid: GridKey,
    na: u64,
    n0: u64,
    wavelength: u64,
    cutoff: Cutoff,
}

type Table<K, V> = RwLock<HashMap<K, Arc<V>>>;

/// Lookup-or-build on one table. Concurrent misses may build twice; the
/// first value stored wins and is returned to both.
fn fetch<K, V>(table: &Table<K, V>, key: K, build: impl FnOnce() -> Result<V>) -> Result<Arc<V>>
where
    K: Eq + Hash + Copy + std::fmt::Debug,
{
    if let Ok(read) = table.read() {
        if let Some(value) = read.get(&key) {
            return Ok(value.clone());
        }
    }
    debug!(?key, "grid cache miss");
    let value = Arc::new(build()?);
    match table.write() {
        Ok(mut write) => Ok(write.entry(key).or_insert(value).clone()),
        Err(_) => Ok(value),
    }
}

fn size<K, V>(table: &Table<K, V>) -> usize {
    table.read().map(|t| t.len()).unwrap_or(0)
}

/// Cache of frequency-domain grids, passed to whoever needs them.
#[derive(Debug, Default)]
pub struct GridCache {
    frequency: Table<GridKey, FrequencyGrid>,
    gamma: Table<GammaKey, GammaField>,
    pupil: Table<PupilKey, PupilMask>,
}

impl GridCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frequency_grid(&self, grid: &Grid) -> Arc<FrequencyGrid> {
        let built = fetch(&self.frequency, GridKey::from(grid), || {
            Ok(FrequencyGrid::new(grid))
        });
        // building a frequency grid cannot fail
        built.unwrap_or_else(|_| Arc::new(FrequencyGrid::new(grid)))
    }

    pub fn gamma(
        &self,
        grid: &Grid,
        medium: &Medium,
        policy: EvanescentPolicy,
        cutoff: Cutoff,
    ) -> Result<Arc<GammaField>> {
        let key = GammaKey {
            grid: GridKey::from(grid),
            n0: medium.n0.to_bits(),
            wavelength: medium.wavelength.to_bits(),
            policy,
            cutoff,
        };
        fetch(&self.gamma, key, || {
            GammaField::new(&self.frequency_grid(grid), medium, policy, cutoff)
        })
    }

    pub fn pupil(&self, grid: &Grid, na: f64, medium: &Medium, cutoff: Cutoff) -> Result<Arc<PupilMask>> {
        let key = PupilKey {
            grid: GridKey::from(grid),
            na: na.to_bits(),
            n0: medium.n0.to_bits(),
            wavelength: medium.wavelength.to_bits(),
            cutoff,
        };
        fetch(&self.pupil, key, || {
            PupilMask::new(&self.frequency_grid(grid), na, medium, cutoff)
        })
    }

    /// Number of cached values across all tables.
    pub fn len(&self) -> usize {
        size(&self.frequency) + size(&self.gamma) + size(&self.pupil)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut table) = self.frequency.write() {
            table.clear();
        }
        if let Ok(mut table) = self.gamma.write() {
            table.clear();
        }
        if let Ok(mut table) = self.pupil.write() {
            table.clear();
        }
    }
}
