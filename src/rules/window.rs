use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// At or after the latest timestamp; advances the window.
    InOrder,
    /// Older than the latest timestamp but still inside the window.
    Late,
    /// Older than the window floor; not retained.
    BeyondFloor,
}

/// Time-bounded history for one (tenant, asset, sensor), ordered by canonical timestamp.
///
/// Eviction is driven by the newest timestamp seen, never by wall-clock time. A point stays in the
/// window while `latest - timestamp <= retention`.
#[derive(Debug)]
pub struct RocWindow {
    retention_seconds: i64,
    points: VecDeque<WindowPoint>,
    latest: Option<DateTime<Utc>>,
    last_touched: Instant,
}

impl RocWindow {
    pub fn new(retention_seconds: i64) -> Self {
        Self {
            retention_seconds: retention_seconds.max(1),
            points: VecDeque::new(),
            latest: None,
            last_touched: Instant::now(),
        }
    }

    pub fn seeded(retention_seconds: i64, mut points: Vec<WindowPoint>) -> Self {
        points.sort_by_key(|point| point.timestamp);
        let mut window = Self::new(retention_seconds);
        window.latest = points.last().map(|point| point.timestamp);
        window.points = points.into();
        window.evict();
        window
    }

    pub fn retention_seconds(&self) -> i64 {
        self.retention_seconds
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_touched)
    }

    pub fn observe(&mut self, timestamp: DateTime<Utc>, value: f64) -> Observation {
        self.last_touched = Instant::now();
        let point = WindowPoint { timestamp, value };

        let latest = match self.latest {
            Some(latest) if timestamp < latest => latest,
            _ => {
                self.latest = Some(timestamp);
                self.points.push_back(point);
                self.evict();
                return Observation::InOrder;
            }
        };

        if timestamp < self.floor(latest) {
            return Observation::BeyondFloor;
        }

        let index = self
            .points
            .iter()
            .position(|existing| existing.timestamp > timestamp)
            .unwrap_or(self.points.len());
        self.points.insert(index, point);
        Observation::Late
    }

    /// Change between the oldest point within `window_seconds` of the latest and the latest point.
    /// `None` until at least two points fall inside that span.
    pub fn delta_over(&self, window_seconds: i64) -> Option<f64> {
        let latest = self.latest?;
        let cutoff = latest - ChronoDuration::seconds(window_seconds.max(0));
        let mut in_span = self.points.iter().filter(|point| point.timestamp >= cutoff);
        let oldest = in_span.next()?;
        let newest = in_span.last()?;
        Some(newest.value - oldest.value)
    }

    fn floor(&self, latest: DateTime<Utc>) -> DateTime<Utc> {
        latest - ChronoDuration::seconds(self.retention_seconds)
    }

    fn evict(&mut self) {
        let Some(latest) = self.latest else {
            return;
        };
        let floor = self.floor(latest);
        while let Some(front) = self.points.front() {
            if front.timestamp < floor {
                self.points.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
impl RocWindow {
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.latest
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_225_600 + seconds, 0).unwrap()
    }

    #[test]
    fn evicts_points_older_than_window_relative_to_latest() {
        let mut window = RocWindow::new(60);
        window.observe(at(0), 70.0);
        window.observe(at(30), 76.0);
        assert_eq!(window.delta_over(60), Some(6.0));

        window.observe(at(61), 92.0);
        assert_eq!(window.len(), 2);
        assert_eq!(window.delta_over(60), Some(16.0));
    }

    #[test]
    fn point_exactly_at_window_edge_is_kept() {
        let mut window = RocWindow::new(60);
        window.observe(at(0), 70.0);
        window.observe(at(60), 92.0);
        assert_eq!(window.len(), 2);
        assert_eq!(window.delta_over(60), Some(22.0));
    }

    #[test]
    fn single_point_gives_no_delta() {
        let mut window = RocWindow::new(60);
        assert_eq!(window.delta_over(60), None);
        window.observe(at(0), 70.0);
        assert_eq!(window.delta_over(60), None);
        window.observe(at(120), 75.0);
        assert_eq!(window.len(), 1);
        assert_eq!(window.delta_over(60), None);
    }

    #[test]
    fn late_point_inside_window_is_inserted_without_moving_latest() {
        let mut window = RocWindow::new(60);
        window.observe(at(100), 50.0);
        window.observe(at(150), 60.0);
        assert_eq!(window.observe(at(95), 10.0), Observation::Late);
        assert_eq!(window.latest(), Some(at(150)));
        assert_eq!(window.len(), 3);
        assert_eq!(window.delta_over(60), Some(50.0));

        // A subsequent in-order point evicts relative to 150 → 171, not relative to the late point.
        window.observe(at(171), 61.0);
        assert_eq!(window.len(), 2);
        assert_eq!(window.delta_over(60), Some(1.0));
    }

    #[test]
    fn late_point_beyond_floor_is_discarded() {
        let mut window = RocWindow::new(60);
        window.observe(at(100), 50.0);
        window.observe(at(150), 60.0);
        assert_eq!(window.observe(at(10), 500.0), Observation::BeyondFloor);
        assert_eq!(window.latest(), Some(at(150)));
        assert_eq!(window.len(), 2);
        assert_eq!(window.delta_over(60), Some(10.0));
    }

    #[test]
    fn narrower_rule_window_uses_subset_of_retention() {
        let mut window = RocWindow::new(300);
        window.observe(at(0), 10.0);
        window.observe(at(200), 20.0);
        window.observe(at(290), 26.0);
        assert_eq!(window.delta_over(300), Some(16.0));
        assert_eq!(window.delta_over(120), Some(6.0));
        assert_eq!(window.delta_over(30), None);
    }

    #[test]
    fn seeded_window_sorts_and_evicts() {
        let window = RocWindow::seeded(
            60,
            vec![
                WindowPoint { timestamp: at(61), value: 92.0 },
                WindowPoint { timestamp: at(0), value: 70.0 },
                WindowPoint { timestamp: at(30), value: 76.0 },
            ],
        );
        assert_eq!(window.latest(), Some(at(61)));
        assert_eq!(window.len(), 2);
        assert_eq!(window.delta_over(60), Some(16.0));
    }
}
