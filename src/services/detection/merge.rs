// Noise filtering and fixed-point merging of fragment rectangles

use crate::core::types::Rect;

/// Drops rectangles that are too small or too elongated to be text
#[derive(Debug, Clone, Copy)]
pub struct RectFilter {
    pub min_area: u64,
    pub max_aspect_ratio: f64,
}

impl RectFilter {
    pub fn keeps(&self, rect: &Rect) -> bool {
        rect.area() > self.min_area && rect.aspect_ratio() < self.max_aspect_ratio
    }

    pub fn apply(&self, rects: Vec<Rect>) -> Vec<Rect> {
        rects.into_iter().filter(|r| self.keeps(r)).collect()
    }
}

/// Result of merging to a fixed point
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub rects: Vec<Rect>,
    /// Full pairwise passes run, including the final pass with no merges
    pub passes: usize,
    pub merges: usize,
}

/// True when both edge gaps are strictly below `max_gap` pixels
pub fn is_near(a: &Rect, b: &Rect, max_gap: f64) -> bool {
    let (gap_x, gap_y) = a.gaps(b);
    (gap_x as f64) < max_gap && (gap_y as f64) < max_gap
}

/// Repeats pairwise passes over the worklist, replacing each near pair with its
/// union, until a pass performs no merges.
///
/// Union rectangles only grow, so a pair that was too far apart can become near
/// after an intervening merge; a single pass is not enough. Each pass is O(n²)
/// and removes at least one rectangle, so at most n passes run.
pub fn merge_until_stable(rects: Vec<Rect>, max_gap: f64) -> MergeOutcome {
    let mut worklist = rects;
    let mut passes = 0;
    let mut merges = 0;

    loop {
        passes += 1;
        let mut merged_this_pass = 0;

        let mut i = 0;
        while i < worklist.len() {
            let mut j = i + 1;
            while j < worklist.len() {
                if is_near(&worklist[i], &worklist[j], max_gap) {
                    let absorbed = worklist.swap_remove(j);
                    worklist[i] = worklist[i].union(&absorbed);
                    merged_this_pass += 1;
                    // worklist[i] grew; rescan its partners from the start
                    j = i + 1;
                } else {
                    j += 1;
                }
            }
            i += 1;
        }

        merges += merged_this_pass;
        if merged_this_pass == 0 {
            break;
        }
    }

    MergeOutcome {
        rects: worklist,
        passes,
        merges,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn random_rects(rng: &mut StdRng, count: usize) -> Vec<Rect> {
        (0..count)
            .map(|_| {
                Rect::new(
                    rng.gen_range(0..900),
                    rng.gen_range(0..1200),
                    rng.gen_range(1..60),
                    rng.gen_range(1..40),
                )
            })
            .collect()
    }

    #[test]
    fn test_filter_thresholds() {
        let filter = RectFilter {
            min_area: 20,
            max_aspect_ratio: 15.0,
        };
        assert!(!filter.keeps(&Rect::new(0, 0, 4, 5))); // area 20
        assert!(filter.keeps(&Rect::new(0, 0, 3, 7))); // area 21
        assert!(!filter.keeps(&Rect::new(0, 0, 150, 10))); // ratio 15
        assert!(filter.keeps(&Rect::new(0, 0, 140, 10)));
        assert!(!filter.keeps(&Rect::new(0, 0, 2, 40))); // vertical rule
    }

    #[test]
    fn test_filter_monotonic_in_thresholds() {
        let mut rng = StdRng::seed_from_u64(7);
        let rects = random_rects(&mut rng, 300);

        let mut previous = usize::MAX;
        for min_area in [0, 10, 20, 50, 200, 800] {
            let kept = RectFilter {
                min_area,
                max_aspect_ratio: 15.0,
            }
            .apply(rects.clone())
            .len();
            assert!(kept <= previous);
            previous = kept;
        }

        let mut previous = usize::MAX;
        for max_aspect_ratio in [40.0, 15.0, 8.0, 3.0, 1.5] {
            let kept = RectFilter {
                min_area: 20,
                max_aspect_ratio,
            }
            .apply(rects.clone())
            .len();
            assert!(kept <= previous);
            previous = kept;
        }
    }

    #[test]
    fn test_near_pair_merges_into_union() {
        let a = Rect::new(100, 100, 40, 20);
        let b = Rect::new(150, 105, 40, 20);
        let outcome = merge_until_stable(vec![a, b], 30.0);
        assert_eq!(outcome.rects, vec![a.union(&b)]);
        assert_eq!(outcome.merges, 1);
        assert_eq!(outcome.passes, 2);
    }

    #[test]
    fn test_gap_equal_to_threshold_stays_apart() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(40, 0, 10, 10); // gap 30
        let outcome = merge_until_stable(vec![a, b], 30.0);
        assert_eq!(outcome.rects.len(), 2);
    }

    #[test]
    fn test_merge_reaches_pair_only_near_after_growth() {
        // c is horizontally close to a and vertically close to b but near
        // neither on its own; only the union of a and b reaches it.
        let a = Rect::new(40, 0, 20, 20);
        let b = Rect::new(80, 40, 20, 20);
        let c = Rect::new(0, 70, 15, 15);
        assert!(is_near(&a, &b, 30.0));
        assert!(!is_near(&a, &c, 30.0));
        assert!(!is_near(&b, &c, 30.0));

        let outcome = merge_until_stable(vec![c, a, b], 30.0);
        assert_eq!(outcome.passes, 3);
        assert_eq!(outcome.rects.len(), 1);
        assert_eq!(outcome.rects[0], a.union(&b).union(&c));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(11);
        let rects = random_rects(&mut rng, 200);
        let first = merge_until_stable(rects, 25.0);
        let second = merge_until_stable(first.rects.clone(), 25.0);
        assert_eq!(second.merges, 0);
        assert_eq!(second.passes, 1);
        assert_eq!(second.rects, first.rects);
    }

    #[test]
    fn test_merge_count_independent_of_order() {
        let mut rng = StdRng::seed_from_u64(42);
        let rects = random_rects(&mut rng, 150);
        let mut expected = merge_until_stable(rects.clone(), 20.0).rects;
        expected.sort_by_key(|r| (r.y, r.x));

        for _ in 0..10 {
            let mut shuffled = rects.clone();
            shuffled.shuffle(&mut rng);
            let mut merged = merge_until_stable(shuffled, 20.0).rects;
            merged.sort_by_key(|r| (r.y, r.x));
            assert_eq!(merged, expected);
        }
    }

    #[test]
    fn test_no_surviving_pair_is_near() {
        let mut rng = StdRng::seed_from_u64(3);
        let merged = merge_until_stable(random_rects(&mut rng, 250), 15.0).rects;
        for (i, a) in merged.iter().enumerate() {
            for b in &merged[i + 1..] {
                assert!(!is_near(a, b, 15.0));
            }
        }
    }
}
