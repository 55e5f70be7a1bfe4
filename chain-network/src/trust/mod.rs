//! Trust scoring of peers
//!
//! A [`TrustMetric`] turns a stream of good and bad events into a value in
//! `[0, 1]` that reacts quickly to misbehaviour and slowly forgets it. The
//! [`TrustMetricStore`] keeps one metric per peer and persists their history.

mod metric;
mod store;

pub use metric::{MetricHistory, TrustMetric, TrustMetricConfig};
pub use store::{TrustMetricStore, DEFAULT_SAVE_INTERVAL, TRUST_STORE_KEY};
