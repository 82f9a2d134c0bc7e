use std::cmp;

/// Predicts the capacity of the next read allocation for one channel.
///
/// The processor asks `next` before every read and reports the observed byte
/// count back through `previous`. Calls are serialized per channel by the
/// worker thread; a predictor is never shared across channels.
pub trait SizePredictor: Send {
    /// The buffer size to allocate for the next read. Always positive.
    fn next(&mut self) -> usize;

    /// Feed back the number of bytes the previous read actually returned.
    fn previous(&mut self, actual: usize);
}

const INDEX_INCREMENT: usize = 4;
const INDEX_DECREMENT: usize = 1;

/// Size predictor that walks a monotone size table.
///
/// The table steps by 16 bytes up to 496, then doubles up to the configured
/// maximum. A read that fills the current estimate jumps the index up by
/// four steps; estimates shrink by one step only after two consecutive
/// undersized reads, which keeps the estimate stable under alternating
/// small/large traffic.
#[derive(Debug)]
pub struct AdaptiveSizePredictor {
    table: Vec<usize>,
    min_index: usize,
    max_index: usize,
    index: usize,
    next_size: usize,
    decreasing: bool,
}

fn size_table(max: usize) -> Vec<usize> {
    let mut table = Vec::new();
    let mut size = 16;
    while size < 512 && size <= max {
        table.push(size);
        size += 16;
    }
    let mut size = 512;
    while size <= max {
        table.push(size);
        match size.checked_mul(2) {
            Some(doubled) => size = doubled,
            None => break,
        }
    }
    // the maximum itself is always reachable, whatever its granularity
    if table.last() != Some(&max) {
        table.push(max);
    }
    table
}

impl AdaptiveSizePredictor {
    /// Create a predictor bounded by `[min, max]` starting at `initial`.
    ///
    /// # Panics
    ///
    /// Panics unless `0 < min <= initial <= max`.
    pub fn new(min: usize, initial: usize, max: usize) -> AdaptiveSizePredictor {
        assert!(min > 0, "minimum read size must be positive");
        assert!(min <= initial && initial <= max, "expected min <= initial <= max");

        let table = size_table(max);
        let max_index = table.len() - 1;
        let min_index = cmp::min(table.partition_point(|&size| size < min), max_index);
        let index = cmp::min(
            cmp::max(table.partition_point(|&size| size < initial), min_index),
            max_index,
        );
        let next_size = table[index];

        AdaptiveSizePredictor {
            table,
            min_index,
            max_index,
            index,
            next_size,
            decreasing: false,
        }
    }
}

impl SizePredictor for AdaptiveSizePredictor {
    fn next(&mut self) -> usize {
        self.next_size
    }

    fn previous(&mut self, actual: usize) {
        let shrink_at = self.table[self.index.saturating_sub(INDEX_DECREMENT + 1)];

        if actual <= shrink_at {
            if self.decreasing {
                self.index = cmp::max(
                    self.index.saturating_sub(INDEX_DECREMENT),
                    self.min_index,
                );
                self.next_size = self.table[self.index];
                self.decreasing = false;
            } else {
                self.decreasing = true;
            }
        } else if actual >= self.next_size {
            self.index = cmp::min(self.index + INDEX_INCREMENT, self.max_index);
            self.next_size = self.table[self.index];
            self.decreasing = false;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_at_initial_estimate() {
        let mut predictor = AdaptiveSizePredictor::new(64, 2048, 65536);
        assert_eq!(2048, predictor.next());
    }

    #[test]
    fn grows_on_full_reads() {
        let mut predictor = AdaptiveSizePredictor::new(64, 2048, 65536);

        let mut last = predictor.next();
        predictor.previous(last);
        assert!(predictor.next() > last);

        for _ in 0..32 {
            last = predictor.next();
            predictor.previous(last);
        }
        assert_eq!(65536, predictor.next());
    }

    #[test]
    fn shrinks_only_after_two_small_reads() {
        let mut predictor = AdaptiveSizePredictor::new(64, 2048, 65536);
        let initial = predictor.next();

        predictor.previous(1);
        assert_eq!(initial, predictor.next());

        predictor.previous(1);
        assert!(predictor.next() < initial);
    }

    #[test]
    fn bounded_under_pathological_feedback() {
        let mut predictor = AdaptiveSizePredictor::new(64, 2048, 65536);

        for _ in 0..1_000_000 {
            predictor.previous(0);
            let size = predictor.next();
            assert!(size > 0);
            assert!(size >= 64);
        }
        assert!(predictor.next() <= 2048);

        for i in 0..1_000_000 {
            predictor.previous(if i % 2 == 0 { 0 } else { 65536 });
            let size = predictor.next();
            assert!(size > 0);
            assert!(size <= 65536);
        }
    }

    #[test]
    fn tiny_bounds_stay_positive() {
        let mut predictor = AdaptiveSizePredictor::new(16, 16, 16);
        for _ in 0..100 {
            predictor.previous(0);
            assert_eq!(16, predictor.next());
            predictor.previous(16);
            assert_eq!(16, predictor.next());
        }
    }
}
