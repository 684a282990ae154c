//! Sender-side statistics over collected latency samples.

use serde::Serialize;

/// min/max/avg/jitter for one direction, in microseconds. All `None` when no
/// samples arrived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DirectionStats {
    pub min_us: Option<f64>,
    pub max_us: Option<f64>,
    pub avg_us: Option<f64>,
    pub jitter_us: Option<f64>,
}

/// Final record of a completed (or aborted) sender session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SenderResult {
    pub packets_tx: u32,
    pub packets_rx: u32,
    pub total_loss_percent: f64,
    pub outbound: DirectionStats,
    pub inbound: DirectionStats,
    pub roundtrip: DirectionStats,
    pub error: Option<String>,
}

/// Stats for one latency list. Clock skew between the two hosts can make
/// one-way samples slightly negative; min and avg are clamped to zero so a
/// skewed clock never reports negative latency. Jitter is the mean absolute
/// difference of consecutive samples.
fn direction_stats(samples: &[f64]) -> DirectionStats {
    if samples.is_empty() {
        return DirectionStats::default();
    }
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    let jitter = if samples.len() > 1 {
        let diffs: Vec<f64> = samples.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
        diffs.iter().sum::<f64>() / diffs.len() as f64
    } else {
        0.0
    };
    DirectionStats {
        min_us: Some(min.max(0.0)),
        max_us: Some(max),
        avg_us: Some(avg.max(0.0)),
        jitter_us: Some(jitter),
    }
}

/// Assemble the final result from the per-direction sample lists.
///
/// `packets_rx` is the number of round-trip samples. Loss is 0 when nothing
/// was sent and 100 when everything sent went unanswered.
pub fn compute_result(
    packets_tx: u32,
    outbound: &[f64],
    inbound: &[f64],
    roundtrip: &[f64],
    error: Option<String>,
) -> SenderResult {
    let packets_rx = roundtrip.len() as u32;
    let total_loss_percent = if packets_tx == 0 {
        0.0
    } else {
        f64::from(packets_tx - packets_rx) / f64::from(packets_tx) * 100.0
    };
    SenderResult {
        packets_tx,
        packets_rx,
        total_loss_percent,
        outbound: direction_stats(outbound),
        inbound: direction_stats(inbound),
        roundtrip: direction_stats(roundtrip),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_accounting() {
        let rt = vec![100.0, 110.0, 105.0];
        let result = compute_result(10, &rt, &rt, &rt, None);
        assert_eq!(result.packets_tx, 10);
        assert_eq!(result.packets_rx, 3);
        assert!((result.total_loss_percent - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_loss_zero_when_nothing_sent() {
        let result = compute_result(0, &[], &[], &[], None);
        assert_eq!(result.total_loss_percent, 0.0);
        assert_eq!(result.roundtrip, DirectionStats::default());
    }

    #[test]
    fn test_loss_full_when_no_replies() {
        let result = compute_result(5, &[], &[], &[], None);
        assert_eq!(result.packets_rx, 0);
        assert_eq!(result.total_loss_percent, 100.0);
    }

    #[test]
    fn test_negative_min_and_avg_clamped() {
        // Clock skew: outbound samples can dip below zero.
        let ob = vec![-50.0, -40.0, -60.0];
        let result = compute_result(3, &ob, &[], &ob, None);
        assert_eq!(result.outbound.min_us, Some(0.0));
        assert_eq!(result.outbound.avg_us, Some(0.0));
        // max keeps the raw value so skew stays visible
        assert_eq!(result.outbound.max_us, Some(-40.0));
    }

    #[test]
    fn test_jitter_is_mean_absolute_delta() {
        let samples = vec![100.0, 110.0, 90.0];
        let result = compute_result(3, &[], &[], &samples, None);
        // |110-100| = 10, |90-110| = 20 → mean 15
        assert_eq!(result.roundtrip.jitter_us, Some(15.0));
    }

    #[test]
    fn test_single_sample_jitter_zero() {
        let result = compute_result(1, &[], &[], &[123.0], None);
        assert_eq!(result.roundtrip.jitter_us, Some(0.0));
    }

    #[test]
    fn test_error_recorded_alongside_result() {
        let result = compute_result(2, &[], &[], &[], Some("send failed".into()));
        assert_eq!(result.error.as_deref(), Some("send failed"));
        assert_eq!(result.total_loss_percent, 100.0);
    }
}
