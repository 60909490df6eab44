//! Core domain model for recorded-dialog ingestion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "drev-core";

/// Call direction decoded from a folder name marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
    Internal,
    #[default]
    Unknown,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
            Direction::Internal => "internal",
            Direction::Unknown => "unknown",
        }
    }

    /// Maps a leading folder-name marker (`in`, `out`, `internal`) to a direction.
    pub fn from_marker(marker: &str) -> Self {
        match marker.trim().to_ascii_lowercase().as_str() {
            "in" => Direction::Incoming,
            "out" => Direction::Outgoing,
            "internal" => Direction::Internal,
            _ => Direction::Unknown,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "incoming" => Direction::Incoming,
            "outgoing" => Direction::Outgoing,
            "internal" => Direction::Internal,
            _ => Direction::Unknown,
        })
    }
}

/// Quality metrics produced upstream for one dialog.
///
/// Scores are conventionally in `[0, 1]` but are not clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub politeness: f64,
    pub friendliness: f64,
    pub rudeness: f64,
    pub manipulativeness: f64,
    pub said_hello: bool,
    pub duration_secs: Option<f64>,
    pub quality: Option<String>,
    pub sale_occurred: Option<bool>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            politeness: 0.0,
            friendliness: 0.0,
            rudeness: 0.0,
            manipulativeness: 0.0,
            said_hello: true,
            duration_secs: None,
            quality: None,
            sale_occurred: None,
        }
    }
}

/// Which score fields a metrics payload actually carried.
///
/// Absent scores hold their zero default in [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoresPresent {
    pub politeness: bool,
    pub friendliness: bool,
    pub rudeness: bool,
    pub manipulativeness: bool,
}

impl ScoresPresent {
    pub const ALL: ScoresPresent = ScoresPresent {
        politeness: true,
        friendliness: true,
        rudeness: true,
        manipulativeness: true,
    };

    pub const NONE: ScoresPresent = ScoresPresent {
        politeness: false,
        friendliness: false,
        rudeness: false,
        manipulativeness: false,
    };
}

/// A single threshold crossing found by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    Rudeness,
    Impoliteness,
    Unfriendliness,
    Manipulation,
    MissingGreeting,
}

impl Violation {
    pub const ALL: [Violation; 5] = [
        Violation::Rudeness,
        Violation::Impoliteness,
        Violation::Unfriendliness,
        Violation::Manipulation,
        Violation::MissingGreeting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Violation::Rudeness => "rudeness",
            Violation::Impoliteness => "impoliteness",
            Violation::Unfriendliness => "unfriendliness",
            Violation::Manipulation => "manipulation",
            Violation::MissingGreeting => "missing_greeting",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Violation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Violation::ALL
            .into_iter()
            .find(|v| v.as_str() == s.trim())
            .ok_or_else(|| format!("unknown violation `{s}`"))
    }
}

/// Serializes violations as the comma-separated form used in storage.
pub fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(Violation::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Inverse of [`join_violations`]; unknown entries are dropped.
pub fn split_violations(text: &str) -> Vec<Violation> {
    text.split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// A leaf record folder discovered on the remote store. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFolder {
    pub root: String,
    pub date_folder: String,
    pub groups: Vec<String>,
    pub leaf: String,
}

impl CandidateFolder {
    fn raw_segments(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.date_folder.as_str())
            .chain(self.groups.iter().map(String::as_str))
            .chain(std::iter::once(self.leaf.as_str()))
            .map(|s| s.trim_matches('/'))
            .filter(|s| !s.trim().is_empty())
    }

    /// Segments from the enumeration root down to the leaf, trimmed, empty ones removed.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw_segments().map(str::trim)
    }

    /// Normalized `date/group/leaf` path relative to the root.
    pub fn relative_path(&self) -> String {
        self.segments().collect::<Vec<_>>().join("/")
    }

    /// Absolute posix path of the leaf folder on the remote store.
    ///
    /// Names are kept exactly as listed so the folder can be opened.
    pub fn remote_path(&self) -> String {
        join_remote(&self.root, &self.raw_segments().collect::<Vec<_>>().join("/"))
    }

    /// The nearest group folder above the leaf, if the layout has one.
    pub fn innermost_group(&self) -> Option<&str> {
        self.groups.last().map(String::as_str)
    }
}

/// Joins remote path segments with single `/` separators.
pub fn join_remote(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    match (base.is_empty(), child.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{child}"),
        (false, true) => base.to_string(),
        (false, false) => format!("{base}/{child}"),
    }
}

/// Structured fields decoded from folder names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedName {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub phone_number: Option<String>,
    pub direction: Direction,
    /// Recorder or line number when the layout encodes one.
    pub channel: Option<String>,
}

impl DecodedName {
    pub fn on_date(date: NaiveDate) -> Self {
        Self {
            date,
            time: NaiveTime::MIN,
            phone_number: None,
            direction: Direction::Unknown,
            channel: None,
        }
    }
}

/// The durable, ingested representation of one recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedRecord {
    pub id: Uuid,
    pub source_id: String,
    pub key: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub phone_number: Option<String>,
    pub direction: Direction,
    pub channel: Option<String>,
    pub transcript_text: String,
    pub summary: String,
    pub metrics: Metrics,
    pub status: String,
    pub violations: Vec<Violation>,
    pub audio_reference: Option<String>,
    pub source_path: String,
    pub ingested_at: DateTime<Utc>,
}

impl IngestedRecord {
    /// Deterministic record id for a `(source, key)` pair.
    pub fn id_for(source_id: &str, key: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{source_id}:{key}").as_bytes())
    }

    pub fn has_violation(&self, violation: Violation) -> bool {
        self.violations.contains(&violation)
    }
}

/// Snapshot of the process-wide sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunState {
    pub running: bool,
    pub current_run_id: Option<Uuid>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> CandidateFolder {
        CandidateFolder {
            root: "/Developers/results-calls/".into(),
            date_folder: "2025-01-14".into(),
            groups: vec![],
            leaf: "in-79180000000-250114-153045".into(),
        }
    }

    #[test]
    fn candidate_paths_are_normalized() {
        let mut c = candidate();
        assert_eq!(c.relative_path(), "2025-01-14/in-79180000000-250114-153045");
        assert_eq!(
            c.remote_path(),
            "/Developers/results-calls/2025-01-14/in-79180000000-250114-153045"
        );

        c.groups = vec!["/3-14-05-00/".into(), String::new()];
        assert_eq!(
            c.relative_path(),
            "2025-01-14/3-14-05-00/in-79180000000-250114-153045"
        );
        assert_eq!(c.innermost_group(), Some(""));
    }

    #[test]
    fn relative_path_trims_names_but_remote_path_keeps_them() {
        let mut c = candidate();
        c.groups = vec![" 3-14-05-00".into(), "  ".into()];
        c.leaf = " d1 ".into();
        assert_eq!(c.relative_path(), "2025-01-14/3-14-05-00/d1");
        assert_eq!(
            c.remote_path(),
            "/Developers/results-calls/2025-01-14/ 3-14-05-00/ d1 "
        );
    }

    #[test]
    fn join_remote_handles_slashes() {
        assert_eq!(join_remote("/a/", "/b"), "/a/b");
        assert_eq!(join_remote("", "b"), "/b");
        assert_eq!(join_remote("/a", ""), "/a");
        assert_eq!(join_remote("", ""), "/");
    }

    #[test]
    fn direction_markers() {
        assert_eq!(Direction::from_marker("in"), Direction::Incoming);
        assert_eq!(Direction::from_marker("OUT"), Direction::Outgoing);
        assert_eq!(Direction::from_marker("internal"), Direction::Internal);
        assert_eq!(Direction::from_marker("s"), Direction::Unknown);
        assert_eq!("outgoing".parse::<Direction>().unwrap(), Direction::Outgoing);
        assert_eq!(
            serde_json::to_string(&Direction::Incoming).unwrap(),
            "\"incoming\""
        );
    }

    #[test]
    fn default_metrics_assume_greeting() {
        let m = Metrics::default();
        assert_eq!(m.rudeness, 0.0);
        assert!(m.said_hello);
        assert!(m.sale_occurred.is_none());
    }

    #[test]
    fn violations_survive_storage_form() {
        let text = join_violations(&[Violation::Rudeness, Violation::MissingGreeting]);
        assert_eq!(text, "rudeness,missing_greeting");
        assert_eq!(
            split_violations(&text),
            vec![Violation::Rudeness, Violation::MissingGreeting]
        );
        assert!(split_violations("").is_empty());
        assert_eq!(split_violations("bogus,manipulation"), vec![Violation::Manipulation]);
    }

    #[test]
    fn record_ids_are_deterministic_per_source() {
        let a = IngestedRecord::id_for("calls", "k1");
        assert_eq!(a, IngestedRecord::id_for("calls", "k1"));
        assert_ne!(a, IngestedRecord::id_for("dialogs", "k1"));
    }
}
