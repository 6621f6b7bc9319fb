/// Indices whose value is strictly below every value in the `left` bars
/// before it and the `right` bars after it. NaN values (and NaN neighbours)
/// never produce a pivot.
pub fn pivot_lows(series: &[f64], left: usize, right: usize) -> Vec<usize> {
    pivots(series, left, right, |candidate, other| other > candidate)
}

/// Indices whose value is strictly above its `left`/`right` neighbourhood.
pub fn pivot_highs(series: &[f64], left: usize, right: usize) -> Vec<usize> {
    pivots(series, left, right, |candidate, other| other < candidate)
}

fn pivots<F>(series: &[f64], left: usize, right: usize, beats: F) -> Vec<usize>
where
    F: Fn(f64, f64) -> bool,
{
    let mut out = Vec::new();
    if series.len() < left + right + 1 {
        return out;
    }

    for i in left..series.len() - right {
        let value = series[i];
        if value.is_nan() {
            continue;
        }
        // Comparisons against NaN are false, so NaN neighbours disqualify.
        let left_ok = (1..=left).all(|k| beats(value, series[i - k]));
        let right_ok = left_ok && (1..=right).all(|k| beats(value, series[i + k]));
        if left_ok && right_ok {
            out.push(i);
        }
    }

    out
}
