//! Per-peer trust metric with faded-memory history

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Weight of the i-th most recent interval is `HISTORY_DATA_WEIGHT^i`
const HISTORY_DATA_WEIGHT: f64 = 0.8;
/// Derivative weight while the trend is improving
const DERIVATIVE_GAMMA_IMPROVING: f64 = 0.0;
/// Derivative weight while the trend is degrading
const DERIVATIVE_GAMMA_DEGRADING: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustMetricConfig {
    /// Weight of the current interval's good/bad ratio
    pub proportional_weight: f64,

    /// Weight of the decayed history
    pub integral_weight: f64,

    /// How far back history is remembered, in seconds
    pub tracking_window_secs: u64,

    /// Length of one interval, in seconds
    pub interval_length_secs: u64,
}

impl Default for TrustMetricConfig {
    fn default() -> Self {
        Self {
            proportional_weight: 0.4,
            integral_weight: 0.6,
            tracking_window_secs: 14 * 24 * 60 * 60,
            interval_length_secs: 60,
        }
    }
}

impl TrustMetricConfig {
    pub fn with_weights(mut self, proportional: f64, integral: f64) -> Self {
        self.proportional_weight = proportional;
        self.integral_weight = integral;
        self
    }

    pub fn with_tracking_window(mut self, window: Duration) -> Self {
        self.tracking_window_secs = window.as_secs();
        self
    }

    pub fn with_interval_length(mut self, interval: Duration) -> Self {
        self.interval_length_secs = interval.as_secs();
        self
    }

    pub fn tracking_window(&self) -> Duration {
        Duration::from_secs(self.tracking_window_secs)
    }

    pub fn interval_length(&self) -> Duration {
        Duration::from_secs(self.interval_length_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.proportional_weight <= 0.0 || self.integral_weight <= 0.0 {
            return Err("Trust metric weights must be positive".to_string());
        }
        if self.proportional_weight + self.integral_weight > 1.0 + f64::EPSILON {
            return Err("Trust metric weights must not sum to more than 1".to_string());
        }
        if self.interval_length_secs == 0 {
            return Err("Trust metric interval length must be greater than 0".to_string());
        }
        if self.tracking_window_secs < self.interval_length_secs {
            return Err("Trust metric tracking window must cover at least one interval".to_string());
        }
        Ok(())
    }

    /// Unset or nonsensical fields fall back to their defaults
    fn effective(&self) -> Self {
        let defaults = Self::default();
        let mut config = self.clone();
        if config.proportional_weight <= 0.0 {
            config.proportional_weight = defaults.proportional_weight;
        }
        if config.integral_weight <= 0.0 {
            config.integral_weight = defaults.integral_weight;
        }
        if config.interval_length_secs == 0 {
            config.interval_length_secs = defaults.interval_length_secs;
        }
        if config.tracking_window_secs < config.interval_length_secs {
            config.tracking_window_secs = defaults.tracking_window_secs;
        }
        config
    }
}

/// Persisted form of a metric's history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricHistory {
    #[serde(rename = "intervals")]
    pub num_intervals: usize,
    pub history: Vec<f64>,
}

#[derive(Debug, Clone)]
struct MetricState {
    proportional_weight: f64,
    integral_weight: f64,
    num_intervals: usize,
    max_intervals: usize,
    history: Vec<f64>,
    history_weights: Vec<f64>,
    history_weight_sum: f64,
    history_max_size: usize,
    history_value: f64,
    good: f64,
    bad: f64,
    paused: bool,
}

/// Trust in a single peer, updated by good and bad events and advanced one
/// interval at a time by its own ticker task
pub struct TrustMetric {
    state: Arc<Mutex<MetricState>>,
    interval_length: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TrustMetric {
    pub fn new(config: &TrustMetricConfig) -> Self {
        let config = config.effective();
        let max_intervals =
            std::cmp::max(1, config.tracking_window_secs / config.interval_length_secs) as usize;

        let state = MetricState {
            proportional_weight: config.proportional_weight,
            integral_weight: config.integral_weight,
            num_intervals: 0,
            max_intervals,
            history: Vec::new(),
            history_weights: Vec::new(),
            history_weight_sum: 0.0,
            history_max_size: interval_to_history_offset(max_intervals) + 1,
            // No history yet counts as a perfect one
            history_value: 1.0,
            good: 0.0,
            bad: 0.0,
            paused: false,
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            interval_length: config.interval_length(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Start advancing intervals in the background
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let period = self.interval_length;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => state.lock().next_time_interval(),
                }
            }
        }));
    }

    /// Stop the ticker and wait for it to finish
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Trust metric ticker failed: {}", e);
            }
        }
    }

    /// Restore from persisted history
    pub fn init(&self, history: &MetricHistory) {
        self.state.lock().init(history);
    }

    pub fn history_json(&self) -> MetricHistory {
        let state = self.state.lock();
        MetricHistory {
            num_intervals: state.num_intervals,
            history: state.history.clone(),
        }
    }

    /// Stop counting intervals until the next event arrives
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn bad_events(&self, num: u32) {
        let mut state = self.state.lock();
        state.unpause();
        state.bad += f64::from(num);
    }

    pub fn good_events(&self, num: u32) {
        let mut state = self.state.lock();
        state.unpause();
        state.good += f64::from(num);
    }

    /// Trust in `[0, 1]`
    pub fn trust_value(&self) -> f64 {
        self.state.lock().calc_trust_value()
    }

    /// Trust as a whole percentage
    pub fn trust_score(&self) -> u8 {
        let score = (self.trust_value() * 100.0).floor();
        score.clamp(0.0, 100.0) as u8
    }

    /// Close the current interval. Normally driven by the ticker.
    pub fn next_time_interval(&self) {
        self.state.lock().next_time_interval();
    }

    /// A detached copy of the current state without a running ticker
    pub fn copy(&self) -> Self {
        Self {
            state: Arc::new(Mutex::new(self.state.lock().clone())),
            interval_length: self.interval_length,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }
}

impl std::fmt::Debug for TrustMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TrustMetric")
            .field("num_intervals", &state.num_intervals)
            .field("good", &state.good)
            .field("bad", &state.bad)
            .field("paused", &state.paused)
            .finish()
    }
}

impl MetricState {
    fn init(&mut self, hist: &MetricHistory) {
        self.num_intervals = hist.num_intervals.min(self.max_intervals);

        let skip = hist.history.len().saturating_sub(self.history_max_size);
        self.history = hist.history[skip..].to_vec();

        self.history_weights = (1..=self.num_intervals)
            .map(|i| HISTORY_DATA_WEIGHT.powi(i as i32))
            .collect();
        self.history_weight_sum = self.history_weights.iter().sum();
        self.history_value = self.calc_history_value();
    }

    fn unpause(&mut self) {
        if self.paused {
            self.good = 0.0;
            self.bad = 0.0;
            self.paused = false;
        }
    }

    fn next_time_interval(&mut self) {
        if self.paused {
            return;
        }

        let value = self.calc_trust_value();
        self.history.push(value);
        if self.history.len() > self.history_max_size {
            let excess = self.history.len() - self.history_max_size;
            self.history.drain(..excess);
        }

        if self.num_intervals < self.max_intervals {
            self.num_intervals += 1;
            let weight = HISTORY_DATA_WEIGHT.powi(self.num_intervals as i32);
            self.history_weights.push(weight);
            self.history_weight_sum += weight;
        }

        self.update_faded_memory();
        self.history_value = self.calc_history_value();
        self.good = 0.0;
        self.bad = 0.0;
    }

    fn calc_trust_value(&self) -> f64 {
        let weighted_p = self.proportional_weight * self.proportional_value();
        let weighted_i = self.integral_weight * self.history_value;
        let weighted_d = self.weighted_derivative();
        (weighted_p + weighted_i + weighted_d).max(0.0)
    }

    fn proportional_value(&self) -> f64 {
        let total = self.good + self.bad;
        if total > 0.0 {
            self.good / total
        } else {
            1.0
        }
    }

    /// Drops are penalised immediately, improvements are not rewarded
    fn weighted_derivative(&self) -> f64 {
        let d = self.proportional_value() - self.history_value;
        let gamma = if d < 0.0 {
            DERIVATIVE_GAMMA_DEGRADING
        } else {
            DERIVATIVE_GAMMA_IMPROVING
        };
        gamma * d
    }

    fn calc_history_value(&self) -> f64 {
        if self.num_intervals == 0 || self.history.is_empty() || self.history_weight_sum == 0.0 {
            return 1.0;
        }
        let hv: f64 = (0..self.num_intervals)
            .map(|i| self.faded_memory_value(i) * self.history_weights[i])
            .sum();
        hv / self.history_weight_sum
    }

    /// Merge older samples into their newer neighbour so that `m` stored
    /// values cover `2^m` intervals
    fn update_faded_memory(&mut self) {
        let size = self.history.len();
        if size < 2 {
            return;
        }
        let end = size - 1;
        for count in 1..size {
            let i = end - count;
            let x = 2f64.powi(count as i32);
            self.history[i] = (self.history[i] * (x - 1.0) + self.history[i + 1]) / x;
        }
    }

    fn faded_memory_value(&self, interval: usize) -> f64 {
        let first = self.history.len() - 1;
        if interval == 0 {
            return self.history[first];
        }
        let offset = interval_to_history_offset(interval);
        self.history[first.saturating_sub(offset)]
    }
}

/// History slot holding interval `i`: `floor(log2(i))`
fn interval_to_history_offset(interval: usize) -> usize {
    if interval == 0 {
        0
    } else {
        interval.ilog2() as usize
    }
}
