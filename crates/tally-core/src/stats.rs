//! Reduction of a completed result set to summary statistics.

use std::fmt;

use crate::types::ResultSet;

/// Median of `values`: the middle element for an odd count, the mean of the
/// two middle elements for an even count. Returns `None` for an empty input.
pub fn median(values: impl IntoIterator<Item = u64>) -> Option<f64> {
    let mut sorted: Vec<u64> = values.into_iter().collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_unstable();

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0)
    } else {
        Some(sorted[mid] as f64)
    }
}

/// Summary of a completed result set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultStats {
    pub count: usize,
    pub min: u64,
    pub max: u64,
    pub median: f64,
}

impl ResultStats {
    /// Compute statistics over `results`. Returns `None` if it is empty.
    pub fn from_results(results: &ResultSet) -> Option<Self> {
        let median = median(results.values().copied())?;
        Some(Self {
            count: results.len(),
            min: results.values().copied().min()?,
            max: results.values().copied().max()?,
            median,
        })
    }
}

impl fmt::Display for ResultStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n={} min={} max={} median={}", self.count, self.min, self.max, self.median)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TicketId;

    #[test]
    fn odd_count_takes_middle() {
        assert_eq!(median([5, 1, 3]), Some(3.0));
    }

    #[test]
    fn even_count_averages_middle_pair() {
        assert_eq!(median([3, 1, 4, 1]), Some(2.0));
        assert_eq!(median([1, 2]), Some(1.5));
    }

    #[test]
    fn empty_has_no_median() {
        assert_eq!(median(Vec::new()), None);
    }

    #[test]
    fn large_values_do_not_overflow() {
        assert_eq!(median([u64::MAX, u64::MAX]), Some(u64::MAX as f64));
    }

    #[test]
    fn stats_from_results() {
        let results: ResultSet = [(TicketId(1), 3), (TicketId(2), 1), (TicketId(3), 4), (TicketId(4), 1)]
            .into_iter()
            .collect();
        let stats = ResultStats::from_results(&results).unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.min, 1);
        assert_eq!(stats.max, 4);
        assert_eq!(stats.median, 2.0);
        assert!(ResultStats::from_results(&ResultSet::new()).is_none());
    }
}
