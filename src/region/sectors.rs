//! Used-sector bookkeeping for a single region file.

use super::HEADER_SECTORS;

const WORD_BITS: usize = 64;

/// Bitset with one bit per sector of the file. A set bit means the sector is
/// covered by a live record or belongs to the control region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorBitmap {
    words: Vec<u64>,
    len: usize,
}

impl SectorBitmap {
    /// A bitmap for a file of `len` sectors with the control sectors reserved.
    pub fn new(len: usize) -> Self {
        let mut bitmap = SectorBitmap {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        };
        bitmap.set_range(0, HEADER_SECTORS.min(len), true);
        bitmap
    }

    /// Number of sectors in the file.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_used(&self, sector: usize) -> bool {
        sector < self.len && self.words[sector / WORD_BITS] & (1 << (sector % WORD_BITS)) != 0
    }

    pub fn used_count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Marks `start..start + count` as used or free. Sectors past the end of
    /// the file are ignored.
    pub fn set_range(&mut self, start: usize, count: usize, used: bool) {
        let end = (start + count).min(self.len);
        for sector in start.min(end)..end {
            let mask = 1u64 << (sector % WORD_BITS);
            let word = &mut self.words[sector / WORD_BITS];
            if used {
                *word |= mask;
            } else {
                *word &= !mask;
            }
        }
    }

    /// Extends the file by `count` free sectors.
    pub fn grow(&mut self, count: usize) {
        self.len += count;
        self.words.resize(self.len.div_ceil(WORD_BITS), 0);
    }

    /// First free run of at least `count` sectors after the control region.
    ///
    /// Linear scan; the first run that fits wins even when a tighter one
    /// exists further on.
    pub fn find_free_run(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }

        let mut run_start = HEADER_SECTORS;
        let mut run_len = 0;
        for sector in HEADER_SECTORS..self.len {
            if self.is_used(sector) {
                run_len = 0;
                run_start = sector + 1;
                continue;
            }
            run_len += 1;
            if run_len == count {
                return Some(run_start);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_sectors_reserved() {
        let bitmap = SectorBitmap::new(10);
        assert!(bitmap.is_used(0));
        assert!(bitmap.is_used(1));
        assert!(!bitmap.is_used(2));
        assert_eq!(bitmap.used_count(), 2);
        assert_eq!(bitmap.find_free_run(8), Some(2));
        assert_eq!(bitmap.find_free_run(9), None);
    }

    #[test]
    fn test_first_fit_skips_short_runs() {
        let mut bitmap = SectorBitmap::new(200);
        bitmap.set_range(2, 198, true);
        // Free runs: [10, 12) of length 2, [50, 55) of length 5, [100, 103) of length 3.
        bitmap.set_range(10, 2, false);
        bitmap.set_range(50, 5, false);
        bitmap.set_range(100, 3, false);

        assert_eq!(bitmap.find_free_run(1), Some(10));
        assert_eq!(bitmap.find_free_run(2), Some(10));
        // First fit, not best fit: the 5-run comes before the tighter 3-run.
        assert_eq!(bitmap.find_free_run(3), Some(50));
        assert_eq!(bitmap.find_free_run(6), None);
    }

    #[test]
    fn test_grow_across_word_boundary() {
        let mut bitmap = SectorBitmap::new(60);
        bitmap.set_range(2, 58, true);
        assert_eq!(bitmap.find_free_run(1), None);

        bitmap.grow(256);
        assert_eq!(bitmap.len(), 316);
        assert_eq!(bitmap.find_free_run(256), Some(60));
        bitmap.set_range(60, 70, true);
        assert!((60..130).all(|s| bitmap.is_used(s)));
        assert!(!bitmap.is_used(130));
        assert_eq!(bitmap.used_count(), 130);
    }

    #[test]
    fn test_set_range_clamps_to_file() {
        let mut bitmap = SectorBitmap::new(4);
        bitmap.set_range(3, 10, true);
        assert!(bitmap.is_used(3));
        assert!(!bitmap.is_used(4));
        assert_eq!(bitmap.used_count(), 1);
    }
}
