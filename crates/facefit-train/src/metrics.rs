use std::collections::BTreeMap;

/// Mean of the values recorded since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub fn record(&mut self, value: f32) {
        self.sum += value as f64;
        self.count += 1;
    }

    pub fn mean(&self) -> Option<f32> {
        (self.count > 0).then(|| (self.sum / self.count as f64) as f32)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Running means keyed by summary tag.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    values: BTreeMap<String, RunningMean>,
}

impl Metrics {
    pub fn record(&mut self, tag: &str, value: f32) {
        self.values.entry(tag.to_string()).or_default().record(value);
    }

    /// Current means, sorted by tag; tags with no values are skipped.
    pub fn means(&self) -> Vec<(String, f32)> {
        self.values
            .iter()
            .filter_map(|(tag, m)| m.mean().map(|v| (tag.clone(), v)))
            .collect()
    }

    pub fn get(&self, tag: &str) -> Option<f32> {
        self.values.get(tag).and_then(RunningMean::mean)
    }

    pub fn reset(&mut self) {
        self.values.values_mut().for_each(RunningMean::reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_mean() {
        let mut m = RunningMean::default();
        assert_eq!(m.mean(), None);
        m.record(1.0);
        m.record(3.0);
        assert_eq!(m.mean(), Some(2.0));
        m.reset();
        assert_eq!(m.mean(), None);
    }

    #[test]
    fn test_metrics_reset_keeps_tags_empty() {
        let mut metrics = Metrics::default();
        metrics.record("loss", 4.0);
        metrics.record("shape_loss", 1.0);
        metrics.record("loss", 2.0);
        assert_eq!(metrics.get("loss"), Some(3.0));
        assert_eq!(metrics.means().len(), 2);
        metrics.reset();
        assert!(metrics.means().is_empty());
    }
}
