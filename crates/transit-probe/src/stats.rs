use serde::Serialize;

/// Distribution of the latency samples of one completed window, in ms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowStats {
    pub count: usize,
    pub min: f64,
    pub median: f64,
    pub max: f64,
    pub mean: f64,
    /// Population standard deviation.
    pub stddev: f64,
}

/// Summarizes `samples` without modifying them; `None` for an empty set.
///
/// ```
/// use transit_probe::stats::summarize;
///
/// let stats = summarize(&[10.0, 20.0, 15.0, 12.0, 18.0]).expect("non-empty");
/// assert_eq!((stats.min, stats.median, stats.max), (10.0, 15.0, 20.0));
/// ```
pub fn summarize(samples: &[f64]) -> Option<WindowStats> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let count = sorted.len();
    let mid = count / 2;
    let median = if count % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };
    let mean = sorted.iter().sum::<f64>() / count as f64;
    let variance = sorted
        .iter()
        .map(|sample| (sample - mean).powi(2))
        .sum::<f64>()
        / count as f64;

    Some(WindowStats {
        count,
        min: sorted[0],
        median,
        max: sorted[count - 1],
        mean,
        stddev: variance.sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_has_no_stats() {
        assert_eq!(summarize(&[]), None);
    }

    #[test]
    fn single_sample() {
        let stats = summarize(&[7.5]).expect("stats");
        assert_eq!(stats.count, 1);
        assert_eq!((stats.min, stats.median, stats.max), (7.5, 7.5, 7.5));
        assert_eq!(stats.stddev, 0.0);
    }

    #[test]
    fn even_count_median_is_mean_of_middle_pair() {
        let stats = summarize(&[4.0, 1.0, 3.0, 2.0]).expect("stats");
        assert_eq!(stats.median, 2.5);
        assert_eq!(stats.mean, 2.5);
    }

    #[test]
    fn stddev_is_population() {
        // Population stddev of this set is exactly 2; the sample stddev is not.
        let stats = summarize(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).expect("stats");
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.stddev, 2.0);
    }

    #[test]
    fn input_is_left_untouched() {
        let samples = vec![3.0, 1.0, 2.0];
        let _ = summarize(&samples);
        assert_eq!(samples, vec![3.0, 1.0, 2.0]);
    }

    #[test]
    fn ordering_holds_for_assorted_sets() {
        let sets: [&[f64]; 5] = [
            &[1.0],
            &[5.0, -1.0],
            &[0.25, 0.25, 0.25],
            &[100.0, 3.0, 42.0, 7.0, 7.0, 0.5],
            &[-3.0, -2.0, 9.5, 1e6, 2.0],
        ];
        for samples in sets {
            let stats = summarize(samples).expect("stats");
            assert!(stats.min <= stats.median, "{samples:?}");
            assert!(stats.median <= stats.max, "{samples:?}");
            assert!(stats.stddev >= 0.0);
            assert_eq!(stats.count, samples.len());
        }
    }
}
