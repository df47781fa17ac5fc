//! EMA, RSI and ATR over plain price slices.
//!
//! Every function returns a series aligned to its input (`None` during the
//! warm-up window) or an empty vector when there is not enough data to seed.

/// Exponential moving average seeded with the SMA of the first `period` values.
pub fn ema(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = vec![None; period - 1];
    let mut prev = closes[..period].iter().sum::<f64>() / period as f64;
    out.push(Some(prev));
    for &price in &closes[period..] {
        prev = (price - prev) * k + prev;
        out.push(Some(prev));
    }
    out
}

/// Wilder RSI. The first `period + 1` positions are undefined.
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let gains: Vec<f64> = deltas.iter().map(|d| d.max(0.0)).collect();
    let losses: Vec<f64> = deltas.iter().map(|d| (-d).max(0.0)).collect();

    let p = period as f64;
    let mut avg_gain = gains[..period].iter().sum::<f64>() / p;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / p;

    let mut out = vec![None; period + 1];
    for i in period..deltas.len() {
        avg_gain = (avg_gain * (p - 1.0) + gains[i]) / p;
        avg_loss = (avg_loss * (p - 1.0) + losses[i]) / p;
        let value = if avg_loss == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
        };
        out.push(Some(value));
    }
    out
}

/// Wilder ATR. The first `period` positions are undefined.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = closes.len().min(highs.len()).min(lows.len());
    if period == 0 || n < period + 1 {
        return Vec::new();
    }
    let tr: Vec<f64> = (1..n)
        .map(|i| {
            (highs[i] - lows[i])
                .max((highs[i] - closes[i - 1]).abs())
                .max((lows[i] - closes[i - 1]).abs())
        })
        .collect();

    let p = period as f64;
    let mut prev = tr[..period].iter().sum::<f64>() / p;
    let mut out = vec![None; period];
    out.push(Some(prev));
    for &t in &tr[period..] {
        prev = (prev * (p - 1.0) + t) / p;
        out.push(Some(prev));
    }
    out
}

/// Most recent defined value of an aligned series.
pub fn latest(series: &[Option<f64>]) -> Option<f64> {
    series.last().copied().flatten()
}

/// Mean of the last `period` values (or all of them when fewer exist).
pub fn trailing_mean(values: &[f64], period: usize) -> f64 {
    let n = values.len().min(period);
    if n == 0 {
        return 0.0;
    }
    values.iter().rev().take(n).sum::<f64>() / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn ema_is_aligned_and_seeded_with_sma() {
        let closes = [1.0, 2.0, 3.0, 4.0, 5.0];
        let out = ema(&closes, 3);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert!(close(out[2].unwrap(), 2.0));
        // k = 0.5 → 3.0, then 4.0
        assert!(close(out[3].unwrap(), 3.0));
        assert!(close(out[4].unwrap(), 4.0));
    }

    #[test]
    fn ema_too_short_is_empty() {
        assert!(ema(&[1.0, 2.0], 3).is_empty());
    }

    #[test]
    fn rsi_extremes() {
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let falling: Vec<f64> = rising.iter().rev().copied().collect();
        assert_eq!(latest(&rsi(&rising, 14)), Some(100.0));
        assert_eq!(latest(&rsi(&falling, 14)), Some(0.0));
    }

    #[test]
    fn rsi_warmup_is_period_plus_one() {
        let closes: Vec<f64> = (0..20).map(|i| (i as f64).sin() + 10.0).collect();
        let out = rsi(&closes, 14);
        assert_eq!(out.len(), 20);
        assert!(out[..15].iter().all(Option::is_none));
        assert!(out[15..].iter().all(Option::is_some));
        assert!(rsi(&closes[..14], 14).is_empty());
    }

    #[test]
    fn atr_of_constant_range() {
        let highs = vec![11.0; 20];
        let lows = vec![9.0; 20];
        let closes = vec![10.0; 20];
        let out = atr(&highs, &lows, &closes, 14);
        assert_eq!(out.len(), 20);
        assert!(out[..14].iter().all(Option::is_none));
        assert!(close(latest(&out).unwrap(), 2.0));
    }

    #[test]
    fn atr_uses_gaps_against_previous_close() {
        // Gap up: |high - prev close| dominates.
        let highs = [10.0, 20.0, 20.0];
        let lows = [9.0, 19.0, 19.0];
        let closes = [10.0, 19.5, 19.5];
        let out = atr(&highs, &lows, &closes, 1);
        assert!(close(out[1].unwrap(), 10.0));
        assert!(close(out[2].unwrap(), 1.0));
    }

    #[test]
    fn trailing_mean_handles_short_input() {
        assert!(close(trailing_mean(&[1.0, 2.0, 3.0], 20), 2.0));
        assert!(close(trailing_mean(&[1.0, 2.0, 3.0, 5.0], 2), 4.0));
        assert_eq!(trailing_mean(&[], 5), 0.0);
    }
}
