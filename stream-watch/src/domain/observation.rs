//! A single point-in-time reading of a target's page.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Timestamp format used in observation logs and status snapshots.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Values extracted from a target page by one successful read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub viewers: u64,
    pub game: Option<String>,
    pub observed_at: DateTime<Local>,
}

impl Observation {
    pub fn new(viewers: u64, game: Option<String>) -> Self {
        Self {
            viewers,
            game,
            observed_at: Local::now(),
        }
    }

    /// Render as `timestamp,viewers,game`.
    ///
    /// Commas and line breaks inside the game name are replaced so each
    /// observation stays on a single three-column line.
    pub fn to_csv_line(&self) -> String {
        let game = self
            .game
            .as_deref()
            .unwrap_or_default()
            .replace([',', '\n', '\r'], " ");
        format!(
            "{},{},{}",
            self.observed_at.format(TIMESTAMP_FORMAT),
            self.viewers,
            game.trim()
        )
    }
}
