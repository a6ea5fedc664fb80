use std::collections::BTreeMap;

/// A per-iteration record that can be flattened into named scalars.
pub trait MetricsRecord {
    fn scalars(&self) -> Vec<(String, f64)>;
}

/// Incremental mean over the last `window` samples (all samples when unbounded).
#[derive(Clone, Debug, Default)]
pub struct RunningAverage {
    value: f64,
    count: usize,
    window: Option<usize>,
}

impl RunningAverage {
    pub fn new(window: Option<usize>) -> Self {
        Self {
            value: 0.0,
            count: 0,
            window: window.filter(|w| *w > 0),
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        self.count += 1;
        let divisor = match self.window {
            Some(window) => self.count.min(window),
            None => self.count,
        };
        self.value += (sample - self.value) / divisor as f64;
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Running averages for every metric name seen so far.
#[derive(Clone, Debug, Default)]
pub struct MetricsAggregator {
    window: Option<usize>,
    averages: BTreeMap<String, RunningAverage>,
}

impl MetricsAggregator {
    pub fn new(window: Option<usize>) -> Self {
        Self {
            window,
            averages: BTreeMap::new(),
        }
    }

    pub fn update<R: MetricsRecord + ?Sized>(&mut self, record: &R) {
        for (name, sample) in record.scalars() {
            let window = self.window;
            self.averages
                .entry(name)
                .or_insert_with(|| RunningAverage::new(window))
                .update(sample);
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.averages.get(name).map(RunningAverage::value)
    }

    /// Current averages keyed by name, in sorted order.
    pub fn values(&self) -> BTreeMap<String, f64> {
        self.averages
            .iter()
            .map(|(name, avg)| (name.clone(), avg.value()))
            .collect()
    }

    pub fn reset(&mut self) {
        self.averages.clear();
    }
}
