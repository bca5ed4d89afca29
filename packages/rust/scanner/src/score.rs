//! Relevance scoring.

/// Distinct pattern types at which the diversity term saturates.
const DISTINCT_SATURATION: f64 = 6.0;
/// Pattern hits at which the volume term saturates.
const COUNT_SATURATION: f64 = 20.0;
/// Structural elements at which the structure term saturates.
const ELEMENT_SATURATION: f64 = 15.0;

const DISTINCT_WEIGHT: f64 = 0.5;
const COUNT_WEIGHT: f64 = 0.3;
const ELEMENT_WEIGHT: f64 = 0.2;

/// Bounded weighted combination of pattern diversity, pattern volume and
/// structural size. Always in `[0, 1]`; a pure function of its inputs.
pub fn relevance_score(distinct_types: usize, pattern_count: usize, element_count: usize) -> f64 {
    let term = |n: usize, saturation: f64| (n as f64 / saturation).min(1.0);

    DISTINCT_WEIGHT * term(distinct_types, DISTINCT_SATURATION)
        + COUNT_WEIGHT * term(pattern_count, COUNT_SATURATION)
        + ELEMENT_WEIGHT * term(element_count, ELEMENT_SATURATION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_scores_zero() {
        assert_eq!(relevance_score(0, 0, 0), 0.0);
    }

    #[test]
    fn score_is_bounded() {
        let s = relevance_score(100, 10_000, 10_000);
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn diversity_outweighs_volume() {
        assert!(relevance_score(3, 3, 0) > relevance_score(1, 10, 0));
    }

    #[test]
    fn monotonic_in_each_input() {
        assert!(relevance_score(2, 5, 5) > relevance_score(1, 5, 5));
        assert!(relevance_score(2, 6, 5) > relevance_score(2, 5, 5));
        assert!(relevance_score(2, 5, 6) > relevance_score(2, 5, 5));
    }
}
