//! Status history rendered into the snapshot file.
//!
//! One column is recorded per tick. The rendered form is:
//!
//! ```text
//! Streams,<t1>,<t2>,...
//! website,channel,<status at t1>,<status at t2>,...
//! ```
//!
//! Cells are empty for ticks where the target was not registered.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Local};

use crate::domain::{StreamStatus, Target, TargetKey};
use crate::domain::observation::TIMESTAMP_FORMAT;

/// Header cell of the first snapshot row.
const HEADER: &str = "Streams";

struct HistoryRow {
    key: TargetKey,
    cells: VecDeque<Option<StreamStatus>>,
}

/// Bounded per-tick status history.
pub struct StatusHistory {
    times: VecDeque<DateTime<Local>>,
    rows: Vec<HistoryRow>,
    index: HashMap<TargetKey, usize>,
    limit: usize,
}

impl StatusHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            times: VecDeque::new(),
            rows: Vec::new(),
            index: HashMap::new(),
            limit: limit.max(1),
        }
    }

    /// Record one column with the status of every registered target.
    pub fn record(&mut self, at: DateTime<Local>, targets: &[Target]) {
        self.times.push_back(at);
        let columns = self.times.len();

        for row in &mut self.rows {
            row.cells.push_back(None);
        }

        for target in targets {
            let idx = match self.index.get(&target.key) {
                Some(&idx) => idx,
                None => {
                    self.rows.push(HistoryRow {
                        key: target.key.clone(),
                        cells: std::iter::repeat_n(None, columns).collect(),
                    });
                    self.index.insert(target.key.clone(), self.rows.len() - 1);
                    self.rows.len() - 1
                }
            };
            if let Some(cell) = self.rows[idx].cells.back_mut() {
                *cell = Some(target.status);
            }
        }

        if self.times.len() > self.limit {
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        while self.times.len() > self.limit {
            self.times.pop_front();
            for row in &mut self.rows {
                row.cells.pop_front();
            }
        }

        // Rows of removed targets disappear once they hold no status
        let before = self.rows.len();
        self.rows.retain(|row| row.cells.iter().any(Option::is_some));
        if self.rows.len() != before {
            self.index = self
                .rows
                .iter()
                .enumerate()
                .map(|(idx, row)| (row.key.clone(), idx))
                .collect();
        }
    }

    pub fn column_count(&self) -> usize {
        self.times.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Render the snapshot lines.
    pub fn render(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.rows.len() + 1);

        let mut header = String::from(HEADER);
        for time in &self.times {
            header.push(',');
            header.push_str(&time.format(TIMESTAMP_FORMAT).to_string());
        }
        lines.push(header);

        for row in &self.rows {
            let mut line = row.key.to_line();
            for cell in &row.cells {
                line.push(',');
                if let Some(status) = cell {
                    line.push_str(status.as_str());
                }
            }
            lines.push(line);
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(second: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 5, 1, 12, 0, second)
            .single()
            .unwrap()
    }

    fn target(channel: &str, status: StreamStatus) -> Target {
        let mut target = Target::new(TargetKey::new("twitch", channel));
        target.status = status;
        target
    }

    #[test]
    fn test_empty_history_renders_header() {
        let history = StatusHistory::new(10);
        assert_eq!(history.render(), vec!["Streams"]);
        assert!(history.is_empty());
    }

    #[test]
    fn test_late_target_is_left_padded() {
        let mut history = StatusHistory::new(10);
        history.record(at(0), &[target("a", StreamStatus::Running)]);
        history.record(
            at(1),
            &[
                target("a", StreamStatus::Waiting),
                target("b", StreamStatus::Running),
            ],
        );

        assert_eq!(
            history.render(),
            vec![
                "Streams,2024-05-01 12:00:00,2024-05-01 12:00:01",
                "twitch,a,Running,Waiting",
                "twitch,b,,Running",
            ]
        );
    }

    #[test]
    fn test_removed_target_keeps_its_row() {
        let mut history = StatusHistory::new(10);
        history.record(at(0), &[target("a", StreamStatus::Running)]);
        history.record(at(1), &[]);

        assert_eq!(history.render()[1], "twitch,a,Running,");
    }

    #[test]
    fn test_limit_drops_oldest_columns_and_stale_rows() {
        let mut history = StatusHistory::new(2);
        history.record(at(0), &[target("gone", StreamStatus::Stopped)]);
        history.record(at(1), &[target("a", StreamStatus::Running)]);
        history.record(at(2), &[target("a", StreamStatus::Waiting)]);

        assert_eq!(history.column_count(), 2);
        assert_eq!(history.row_count(), 1);
        assert_eq!(
            history.render(),
            vec![
                "Streams,2024-05-01 12:00:01,2024-05-01 12:00:02",
                "twitch,a,Running,Waiting",
            ]
        );

        // Index stays consistent after rows were dropped
        history.record(at(3), &[target("a", StreamStatus::Stopped)]);
        assert_eq!(history.render()[1], "twitch,a,Waiting,Stopped");
    }
}
