/// Minimum sample count before a windowed median estimate is trusted; below
/// this the prior window's normalizer carries forward unchanged (the
/// windowed normalizer requires more than 5 samples before trusting a new
/// median estimate).
pub const MEDIAN_MIN_SAMPLES: usize = 6;

/// Selects the median of `values` in O(n) expected time via
/// `slice::select_nth_unstable`, Rust's equivalent of `std::nth_element`.
///
/// For an even sample count this returns the *lower* median (the original
/// C++ reference partitions at `size/2`, the upper median; this
/// implementation picks `(size-1)/2` instead so behavior is pinned down
/// exactly rather than left to the ambiguity around the original's
/// off-by-one — see DESIGN.md).
///
/// Panics if `values` is empty; callers are expected to have already
/// checked [`MEDIAN_MIN_SAMPLES`].
pub fn lower_median(values: &mut [f32]) -> f32 {
    assert!(!values.is_empty(), "lower_median called on empty slice");
    let mid = (values.len() - 1) / 2;
    let (_, median, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    *median
}
