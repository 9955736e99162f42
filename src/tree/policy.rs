//! Pluggable split and join policies.
//!
//! When a page fills, the tree proposes every candidate split position to
//! the configured [`SplitPolicy`]; the candidate with the highest positive
//! "goodness" score wins. When neighboring pages empty out, the
//! [`JoinPolicy`] decides whether merging them is worthwhile.
//!
//! Policies are small sum types selected by case-insensitive name - no
//! dynamic dispatch, just a tagged scoring function.

use crate::common::{Error, Result};
use crate::page::KEYBLOCK_LENGTH;

/// Insertion-pattern hint passed to split policies.
///
/// `Forward` means keys are arriving in ascending order at the end of the
/// page, `Reverse` descending at the front; `None` means no pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    Forward,
    Reverse,
    None,
}

/// How a full page is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
    /// Maximize the left page.
    Left,
    /// Maximize the right page.
    Right,
    /// Balance the two sides.
    Even,
    /// Bias roughly 2/3 of the content to the left page.
    Nice,
    /// Aim for a 90%-full left page.
    Left90,
    /// Aim for a 90%-full right page.
    Right90,
    /// Like `Nice`, but for sequential insertions split adjacent to the
    /// insertion point so subsequent inserts fill pages without
    /// resplitting.
    Pack,
}

impl SplitPolicy {
    /// Look up a policy by case-insensitive name.
    ///
    /// # Errors
    /// `UnknownPolicy` for unrecognized names.
    pub fn by_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "LEFT" => Ok(SplitPolicy::Left),
            "RIGHT" => Ok(SplitPolicy::Right),
            "EVEN" => Ok(SplitPolicy::Even),
            "NICE" => Ok(SplitPolicy::Nice),
            "LEFT90" => Ok(SplitPolicy::Left90),
            "RIGHT90" => Ok(SplitPolicy::Right90),
            "PACK" => Ok(SplitPolicy::Pack),
            _ => Err(Error::UnknownPolicy(name.to_string())),
        }
    }

    /// Score one candidate split position; the largest score wins.
    ///
    /// Returns 0 if either side would exceed `capacity`.
    ///
    /// # Arguments
    /// * `sequence` - insertion-pattern hint
    /// * `insert_at` - key-block offset of the entry being inserted
    /// * `kb_offset` - key-block offset of the candidate split position
    /// * `replace` - whether the insertion replaces an existing entry
    /// * `left_size` / `right_size` - bytes each side would hold
    /// * `capacity` - usable bytes per page
    /// * `current_best` - best score seen so far
    #[allow(clippy::too_many_arguments)]
    pub fn split_fit(
        &self,
        sequence: Sequence,
        insert_at: usize,
        kb_offset: usize,
        replace: bool,
        left_size: usize,
        right_size: usize,
        capacity: usize,
        current_best: usize,
    ) -> usize {
        if left_size > capacity || right_size > capacity {
            return 0;
        }
        let left = left_size as i64;
        let right = right_size as i64;
        let cap = capacity as i64;

        let score = match self {
            SplitPolicy::Left => left,
            SplitPolicy::Right => right,
            SplitPolicy::Even => cap - (right - left).abs(),
            SplitPolicy::Nice => 2 * cap - (2 * right - left).abs(),
            SplitPolicy::Left90 => cap - (cap * 9 / 10 - left).abs(),
            SplitPolicy::Right90 => cap - (cap * 9 / 10 - right).abs(),
            SplitPolicy::Pack => {
                let nine_tenths = cap * 9 / 10;
                let sequential = sequence != Sequence::None
                    && !replace
                    && left <= nine_tenths
                    && right <= nine_tenths;
                if sequential {
                    let target = match sequence {
                        Sequence::Forward => insert_at as i64,
                        Sequence::Reverse => insert_at as i64 + KEYBLOCK_LENGTH as i64,
                        Sequence::None => unreachable!(),
                    };
                    2 * cap - (target - kb_offset as i64).abs()
                } else {
                    2 * cap - (2 * right - left).abs()
                }
            }
        };
        let _ = current_best;
        score.max(0) as usize
    }
}

/// How emptied sibling pages are rejoined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Score by the resulting left page size.
    Left,
    /// Score by the resulting right page size.
    Right,
    /// Score by balance.
    Even,
}

impl JoinPolicy {
    /// Look up a policy by case-insensitive name.
    ///
    /// # Errors
    /// `UnknownPolicy` for unrecognized names.
    pub fn by_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "LEFT" => Ok(JoinPolicy::Left),
            "RIGHT" => Ok(JoinPolicy::Right),
            "EVEN" => Ok(JoinPolicy::Even),
            _ => Err(Error::UnknownPolicy(name.to_string())),
        }
    }

    /// Score a proposed residual (left, right) arrangement.
    ///
    /// Returns 0 if either side would exceed `capacity`.
    pub fn join_fit(&self, left_size: usize, right_size: usize, capacity: usize) -> usize {
        if left_size > capacity || right_size > capacity {
            return 0;
        }
        match self {
            JoinPolicy::Left => left_size,
            JoinPolicy::Right => right_size,
            JoinPolicy::Even => capacity - left_size.abs_diff(right_size),
        }
    }

    /// Whether a join producing `virtual_size` bytes is admitted at all.
    pub fn accept_join(&self, virtual_size: usize, capacity: usize) -> bool {
        virtual_size < capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: usize = 8000;

    fn fit(policy: SplitPolicy, left: usize, right: usize) -> usize {
        policy.split_fit(Sequence::None, 0, 0, false, left, right, CAP, 0)
    }

    #[test]
    fn test_by_name_case_insensitive() {
        assert_eq!(SplitPolicy::by_name("pack").unwrap(), SplitPolicy::Pack);
        assert_eq!(SplitPolicy::by_name("Left90").unwrap(), SplitPolicy::Left90);
        assert_eq!(JoinPolicy::by_name("even").unwrap(), JoinPolicy::Even);
        assert!(matches!(
            SplitPolicy::by_name("bogus"),
            Err(Error::UnknownPolicy(_))
        ));
        assert!(JoinPolicy::by_name("nice").is_err());
    }

    #[test]
    fn test_overflow_scores_zero() {
        for policy in [
            SplitPolicy::Left,
            SplitPolicy::Right,
            SplitPolicy::Even,
            SplitPolicy::Nice,
            SplitPolicy::Left90,
            SplitPolicy::Right90,
            SplitPolicy::Pack,
        ] {
            assert_eq!(fit(policy, CAP + 1, 100), 0);
            assert_eq!(fit(policy, 100, CAP + 1), 0);
        }
    }

    #[test]
    fn test_left_right_even() {
        assert_eq!(fit(SplitPolicy::Left, 6000, 2000), 6000);
        assert_eq!(fit(SplitPolicy::Right, 6000, 2000), 2000);
        assert_eq!(fit(SplitPolicy::Even, 4000, 4000), CAP);
        assert_eq!(fit(SplitPolicy::Even, 6000, 2000), CAP - 4000);
    }

    #[test]
    fn test_even_prefers_balance() {
        assert!(fit(SplitPolicy::Even, 4000, 4000) > fit(SplitPolicy::Even, 5000, 3000));
    }

    #[test]
    fn test_nice_biases_two_thirds_left() {
        // At 2/3 left, 1/3 right: |2*right - left| = 0, maximal score.
        let best = fit(SplitPolicy::Nice, 5334, 2667);
        assert!(best > fit(SplitPolicy::Nice, 4000, 4000));
        assert!(best > fit(SplitPolicy::Nice, 6000, 2000));
    }

    #[test]
    fn test_left90_right90() {
        let target = CAP * 9 / 10;
        assert_eq!(fit(SplitPolicy::Left90, target, 1000), CAP);
        assert!(fit(SplitPolicy::Left90, target, 1000) > fit(SplitPolicy::Left90, 4000, 1000));
        assert_eq!(fit(SplitPolicy::Right90, 1000, target), CAP);
    }

    #[test]
    fn test_pack_falls_back_to_nice_when_not_sequential() {
        let nice = fit(SplitPolicy::Nice, 4000, 3000);
        let pack = SplitPolicy::Pack.split_fit(
            Sequence::None,
            100,
            200,
            false,
            4000,
            3000,
            CAP,
            0,
        );
        assert_eq!(nice, pack);

        // A replace also disables the sequential special case.
        let pack_replace = SplitPolicy::Pack.split_fit(
            Sequence::Forward,
            100,
            200,
            true,
            4000,
            3000,
            CAP,
            0,
        );
        assert_eq!(nice, pack_replace);
    }

    #[test]
    fn test_pack_sequential_prefers_split_at_insertion_point() {
        // Forward insertion at key-block offset 400: the candidate right
        // at the insertion point scores highest.
        let at_insert =
            SplitPolicy::Pack.split_fit(Sequence::Forward, 400, 400, false, 4000, 3000, CAP, 0);
        let away =
            SplitPolicy::Pack.split_fit(Sequence::Forward, 400, 200, false, 4000, 3000, CAP, 0);
        assert!(at_insert > away);
        assert_eq!(at_insert, 2 * CAP);

        // Reverse insertion carries the one-key-block correction.
        let reverse = SplitPolicy::Pack.split_fit(
            Sequence::Reverse,
            400,
            400 + KEYBLOCK_LENGTH,
            false,
            4000,
            3000,
            CAP,
            0,
        );
        assert_eq!(reverse, 2 * CAP);
    }

    #[test]
    fn test_join_fit() {
        assert_eq!(JoinPolicy::Left.join_fit(5000, 0, CAP), 5000);
        assert_eq!(JoinPolicy::Right.join_fit(5000, 0, CAP), 0);
        assert_eq!(JoinPolicy::Even.join_fit(3000, 3000, CAP), CAP);
        assert_eq!(JoinPolicy::Left.join_fit(CAP + 1, 0, CAP), 0);
    }

    #[test]
    fn test_accept_join_boundary() {
        assert!(JoinPolicy::Even.accept_join(CAP - 1, CAP));
        assert!(!JoinPolicy::Even.accept_join(CAP, CAP));
        assert!(!JoinPolicy::Even.accept_join(CAP + 1, CAP));
    }
}
