// VELIN Extraction - Planification des fenêtres de pages
// Découpage d'une source volumineuse en lots chevauchants

use tracing::debug;

use crate::ingest::BatchRange;

/// Configuration des lots d'extraction
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Pages par lot
    pub pages_per_batch: u32,
    /// Pages de chevauchement entre lots consécutifs
    pub overlap_pages: u32,
    /// Lots exécutés en parallèle
    pub max_concurrent_batches: usize,
    /// Plancher de contenu par lot (bytes après trim)
    pub content_floor_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            pages_per_batch: 100,
            overlap_pages: 10,
            max_concurrent_batches: (num_cpus::get() / 2).max(2),
            content_floor_bytes: 20,
        }
    }
}

/// Calcule les fenêtres de pages chevauchantes couvrant `[1, total_pages]`.
///
/// Premier lot `[1, min(B, P)]`, puis `[fin_prec - O + 1, fin_prec - O + B]`
/// jusqu'à atteindre P. L'overlap est borné à `B - 1` pour garantir la
/// progression. `P <= B` donne un lot unique.
pub fn calculate_batch_ranges(
    total_pages: u32,
    pages_per_batch: u32,
    overlap_pages: u32,
) -> Vec<BatchRange> {
    if total_pages == 0 || pages_per_batch == 0 {
        return Vec::new();
    }

    // Clamp : l'overlap doit laisser au moins une page de progression
    let overlap = overlap_pages.min(pages_per_batch.saturating_sub(1));

    let mut ranges = Vec::new();
    let mut start = 1u32;
    let mut end = pages_per_batch.min(total_pages);
    loop {
        ranges.push(BatchRange {
            batch_index: ranges.len(),
            page_start: start,
            page_end: end,
        });
        if end >= total_pages {
            break;
        }
        start = end - overlap + 1;
        end = (start + pages_per_batch - 1).min(total_pages);
    }

    debug!(
        "batch plan: {} pages -> {} batches (batch={}, overlap={})",
        total_pages,
        ranges.len(),
        pages_per_batch,
        overlap
    );
    ranges
}

/// Vérifie que l'union des fenêtres couvre `[1, total_pages]` sans trou
pub fn ranges_cover(ranges: &[BatchRange], total_pages: u32) -> bool {
    if total_pages == 0 {
        return ranges.is_empty();
    }
    let Some(first) = ranges.first() else {
        return false;
    };
    if first.page_start != 1 {
        return false;
    }
    let mut covered_to = first.page_end;
    for range in &ranges[1..] {
        if range.page_start > covered_to + 1 {
            return false;
        }
        covered_to = covered_to.max(range.page_end);
    }
    covered_to >= total_pages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(ranges: &[BatchRange]) -> Vec<(u32, u32)> {
        ranges.iter().map(|r| (r.page_start, r.page_end)).collect()
    }

    #[test]
    fn test_250_pages_batch_100_overlap_10() {
        let ranges = calculate_batch_ranges(250, 100, 10);
        assert_eq!(pairs(&ranges), vec![(1, 100), (91, 190), (181, 250)]);
        assert!(ranges_cover(&ranges, 250));
    }

    #[test]
    fn test_single_batch_when_small() {
        let ranges = calculate_batch_ranges(100, 100, 10);
        assert_eq!(pairs(&ranges), vec![(1, 100)]);

        let ranges = calculate_batch_ranges(7, 100, 10);
        assert_eq!(pairs(&ranges), vec![(1, 7)]);
    }

    #[test]
    fn test_overlap_clamped_to_batch_minus_one() {
        // overlap >= batch : clampé, l'extraction termine quand même
        let ranges = calculate_batch_ranges(10, 3, 5);
        assert!(ranges_cover(&ranges, 10));
        for pair in ranges.windows(2) {
            assert!(pair[1].page_start > pair[0].page_start, "progression stricte");
        }
        assert_eq!(ranges.last().unwrap().page_end, 10);
    }

    #[test]
    fn test_zero_overlap_allowed() {
        let ranges = calculate_batch_ranges(6, 2, 0);
        assert_eq!(pairs(&ranges), vec![(1, 2), (3, 4), (5, 6)]);
        assert!(ranges_cover(&ranges, 6));
    }

    #[test]
    fn test_batch_indices_dense() {
        let ranges = calculate_batch_ranges(250, 100, 10);
        for (i, range) in ranges.iter().enumerate() {
            assert_eq!(range.batch_index, i);
        }
    }

    #[test]
    fn test_zero_pages() {
        assert!(calculate_batch_ranges(0, 100, 10).is_empty());
    }

    #[test]
    fn test_page_start_strictly_increasing() {
        let ranges = calculate_batch_ranges(1000, 100, 99);
        for pair in ranges.windows(2) {
            assert!(pair[1].page_start > pair[0].page_start);
        }
        assert!(ranges_cover(&ranges, 1000));
    }
}
