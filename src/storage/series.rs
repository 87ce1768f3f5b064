use crate::Point;

use super::AppendError;

/// In-memory state of one series: its newest point plus the points not yet
/// handed to the persister.
#[derive(Debug, Default)]
pub(super) struct Series {
    last: Option<Point>,
    head: Vec<Point>,
}
impl Series {
    /// Restores the newest point read back from disk.
    pub fn recover(&mut self, point: Point) {
        match self.last {
            Some(last) if last.time >= point.time => {}
            _ => self.last = Some(point),
        }
    }

    /// Returns `Ok(false)` when the point repeats the last one exactly and
    /// nothing was stored.
    pub fn append(&mut self, point: Point) -> Result<bool, AppendError> {
        if let Some(last) = self.last {
            if point.time == last.time {
                if same_value(point.value, last.value) {
                    return Ok(false);
                }
                return Err(AppendError::DuplicateTimestamp);
            }
            if point.time < last.time {
                return Err(AppendError::OutOfOrder);
            }
        }
        self.last = Some(point);
        self.head.push(point);
        Ok(true)
    }

    pub fn is_dirty(&self) -> bool {
        !self.head.is_empty()
    }
    pub fn take_head(&mut self) -> Vec<Point> {
        std::mem::take(&mut self.head)
    }
}

fn same_value(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(time: i64, value: f64) -> Point {
        Point { time, value }
    }

    #[test]
    fn test_classification() {
        let mut series = Series::default();
        assert_eq!(series.append(point(10, 1.0)), Ok(true));
        assert_eq!(series.append(point(9, 1.0)), Err(AppendError::OutOfOrder));
        assert_eq!(
            series.append(point(10, 2.0)),
            Err(AppendError::DuplicateTimestamp)
        );
        assert_eq!(series.append(point(10, 1.0)), Ok(false));
        assert_eq!(series.append(point(11, 3.0)), Ok(true));
        assert_eq!(series.take_head(), vec![point(10, 1.0), point(11, 3.0)]);
        assert!(!series.is_dirty());
    }

    #[test]
    fn test_nan_repeat_is_a_no_op() {
        let mut series = Series::default();
        assert_eq!(series.append(point(1, f64::NAN)), Ok(true));
        assert_eq!(series.append(point(1, f64::NAN)), Ok(false));
    }

    #[test]
    fn test_recover_keeps_newest() {
        let mut series = Series::default();
        series.recover(point(20, 1.0));
        series.recover(point(5, 1.0));
        assert_eq!(series.append(point(19, 1.0)), Err(AppendError::OutOfOrder));
        assert!(!series.is_dirty());
    }
}
