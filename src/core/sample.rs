//! Purpose: Choose which rows of each table get encoded.
//! Exports: `RowSampler`, `RowSelection`, `RowFilter`.
//! Role: Uniform selection without replacement, clamped to the table size.
//! Invariants: Selected rows are distinct and ascending; a fixed seed gives a fixed selection.
use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RowSelection {
    All,
    /// Strictly ascending row ordinals.
    Rows(Vec<u64>),
}

impl RowSelection {
    pub fn len(&self, row_count: u64) -> u64 {
        match self {
            RowSelection::All => row_count,
            RowSelection::Rows(rows) => rows.len() as u64,
        }
    }

    pub fn filter(&self) -> RowFilter<'_> {
        RowFilter {
            selection: self,
            next: 0,
        }
    }
}

/// Streaming membership test for rows visited in ascending order.
pub struct RowFilter<'a> {
    selection: &'a RowSelection,
    next: usize,
}

impl RowFilter<'_> {
    pub fn accepts(&mut self, row: u64) -> bool {
        let rows = match self.selection {
            RowSelection::All => return true,
            RowSelection::Rows(rows) => rows,
        };
        while let Some(&candidate) = rows.get(self.next) {
            if candidate > row {
                return false;
            }
            self.next += 1;
            if candidate == row {
                return true;
            }
        }
        false
    }
}

pub struct RowSampler {
    rng: StdRng,
}

impl RowSampler {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn select(&mut self, row_count: u64, sample_size: Option<u64>) -> RowSelection {
        let Some(sample_size) = sample_size else {
            return RowSelection::All;
        };
        if sample_size >= row_count {
            if sample_size > row_count {
                tracing::debug!(sample_size, row_count, "sample exceeds table; selecting all rows");
            }
            return RowSelection::All;
        }
        let mut rows = rand::seq::index::sample(
            &mut self.rng,
            row_count as usize,
            sample_size as usize,
        )
        .into_iter()
        .map(|row| row as u64)
        .collect::<Vec<_>>();
        rows.sort_unstable();
        RowSelection::Rows(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::{RowSampler, RowSelection};

    #[test]
    fn no_sample_selects_everything() {
        let mut sampler = RowSampler::new(Some(1));
        assert_eq!(sampler.select(10, None), RowSelection::All);
    }

    #[test]
    fn oversized_sample_clamps() {
        let mut sampler = RowSampler::new(Some(1));
        let selection = sampler.select(3, Some(50));
        assert_eq!(selection, RowSelection::All);
        assert_eq!(selection.len(3), 3);
    }

    #[test]
    fn sample_is_exact_distinct_and_sorted() {
        let mut sampler = RowSampler::new(Some(7));
        let RowSelection::Rows(rows) = sampler.select(1000, Some(25)) else {
            panic!("expected a strict subset");
        };
        assert_eq!(rows.len(), 25);
        assert!(rows.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(rows.iter().all(|&row| row < 1000));
    }

    #[test]
    fn seeded_samples_repeat() {
        let a = RowSampler::new(Some(42)).select(500, Some(10));
        let b = RowSampler::new(Some(42)).select(500, Some(10));
        assert_eq!(a, b);
    }

    #[test]
    fn filter_walks_selection_in_order() {
        let selection = RowSelection::Rows(vec![1, 4, 5]);
        let mut filter = selection.filter();
        let accepted = (0..8).filter(|&row| filter.accepts(row)).collect::<Vec<_>>();
        assert_eq!(accepted, vec![1, 4, 5]);

        let all = RowSelection::All;
        let mut filter = all.filter();
        assert!(filter.accepts(0) && filter.accepts(99));
    }
}
