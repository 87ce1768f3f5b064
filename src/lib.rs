pub mod buf;
pub mod codec;
pub mod config;
pub mod exposition;
pub mod metric;
pub mod pipeline;
pub mod storage;
pub mod throttle;
pub mod write;

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

pub use metric::Metric;

pub type MetricKey = String;

/// Milliseconds since the Unix epoch.
pub type Time = i64;

pub const METRIC_NAME_LABEL: &str = "__name__";

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: Metric,
    pub value: f64,
    pub time: Time,
}
impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {} @{}", self.metric, self.value, self.time)
    }
}

/// One stored value of a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub time: Time,
    pub value: f64,
}
pub const POINT_SIZE: usize = 16;

pub fn now_millis() -> Time {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Time::try_from(since_epoch.as_millis()).unwrap_or(Time::MAX)
}
