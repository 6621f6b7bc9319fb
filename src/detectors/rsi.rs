use crate::types::Bar;

/// RSI over closing prices using Wilder's smoothing.
///
/// The first `period` entries are NaN. The seed averages are the simple mean of
/// the first `period` deltas, after which each average is updated as
/// `(avg * (period - 1) + value) / period`.
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; closes.len()];
    if period == 0 || closes.len() <= period {
        return out;
    }

    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for i in 1..=period {
        let change = closes[i] - closes[i - 1];
        if change > 0.0 {
            gain_sum += change;
        } else {
            loss_sum -= change;
        }
    }

    let p = period as f64;
    let mut avg_gain = gain_sum / p;
    let mut avg_loss = loss_sum / p;
    out[period] = rsi_value(avg_gain, avg_loss);

    for i in (period + 1)..closes.len() {
        let change = closes[i] - closes[i - 1];
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
        out[i] = rsi_value(avg_gain, avg_loss);
    }

    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// RSI of bar closes
pub fn rsi_series(bars: &[Bar], period: usize) -> Vec<f64> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    rsi(&closes, period)
}
