//! Common types used throughout SnapSync.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Timestamp layout embedded in snapshot names.
///
/// Zero-padded, so lexicographic order equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Length of a formatted [`TIMESTAMP_FORMAT`] value.
const TIMESTAMP_LEN: usize = 19;

/// Prefix shared by every snapshot directory.
const SNAPSHOT_PREFIX: &str = "backup_";

/// Filesystem-safe identifier for a source folder.
///
/// Derived from the folder's final path segment. Two folders with the same
/// final segment map to the same label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label(String);

impl Label {
    /// Derive a label from a path string.
    ///
    /// Trailing `/` and `\` are stripped, the final segment is kept and every
    /// character outside `[A-Za-z0-9_-]` becomes `_`. Never fails; an empty
    /// final segment yields `_`.
    pub fn sanitize(path: &str) -> Self {
        let trimmed = path.trim_end_matches(['/', '\\']);
        let segment = trimmed
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default();

        let safe: String = segment
            .chars()
            .map(|c| if is_label_char(c) { c } else { '_' })
            .collect();

        if safe.is_empty() {
            Self("_".to_string())
        } else {
            Self(safe)
        }
    }

    /// Derive a label from a filesystem path.
    pub fn from_path(path: &Path) -> Self {
        Self::sanitize(&path.to_string_lossy())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `value` is already a valid label.
    pub fn is_valid(value: &str) -> bool {
        !value.is_empty() && value.chars().all(is_label_char)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Parsed name of a snapshot directory: `backup_<label>_<timestamp>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotName {
    label: Label,
    timestamp: NaiveDateTime,
}

impl SnapshotName {
    /// Create a snapshot name for a label at the given local time.
    ///
    /// Sub-second precision is dropped.
    pub fn new(label: Label, timestamp: NaiveDateTime) -> Self {
        let timestamp = truncate_to_seconds(timestamp);
        Self { label, timestamp }
    }

    /// Parse a directory name belonging to `label`.
    ///
    /// Returns `None` for anything that is not exactly
    /// `backup_<label>_<YYYY-MM-DD_HH-MM-SS>`.
    pub fn parse_for(name: &str, label: &Label) -> Option<Self> {
        let rest = name
            .strip_prefix(SNAPSHOT_PREFIX)?
            .strip_prefix(label.as_str())?
            .strip_prefix('_')?;
        let timestamp = parse_timestamp(rest)?;
        Some(Self {
            label: label.clone(),
            timestamp,
        })
    }

    /// Parse any snapshot directory name, whatever its label.
    pub fn parse(name: &str) -> Option<Self> {
        let body = name.strip_prefix(SNAPSHOT_PREFIX)?;
        if body.len() < TIMESTAMP_LEN + 2 || !body.is_char_boundary(body.len() - TIMESTAMP_LEN) {
            return None;
        }

        let (head, stamp) = body.split_at(body.len() - TIMESTAMP_LEN);
        let label = head.strip_suffix('_')?;
        if !Label::is_valid(label) {
            return None;
        }

        Some(Self {
            label: Label(label.to_string()),
            timestamp: parse_timestamp(stamp)?,
        })
    }

    /// Label this snapshot belongs to.
    pub fn label(&self) -> &Label {
        &self.label
    }

    /// Creation time encoded in the name.
    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// Same label, one second later.
    pub fn next_second(&self) -> Self {
        Self {
            label: self.label.clone(),
            timestamp: self.timestamp + chrono::Duration::seconds(1),
        }
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}_{}",
            SNAPSHOT_PREFIX,
            self.label,
            self.timestamp.format(TIMESTAMP_FORMAT)
        )
    }
}

impl PartialOrd for SnapshotName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SnapshotName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.label.cmp(&other.label))
    }
}

/// Strict parse: the value must round-trip to the same zero-padded text.
fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    if value.len() != TIMESTAMP_LEN {
        return None;
    }
    let parsed = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).ok()?;
    if parsed.format(TIMESTAMP_FORMAT).to_string() != value {
        return None;
    }
    Some(parsed)
}

fn truncate_to_seconds(timestamp: NaiveDateTime) -> NaiveDateTime {
    use chrono::Timelike;
    timestamp.with_nanosecond(0).unwrap_or(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_sanitize_final_segment() {
        assert_eq!(Label::sanitize("/data/docs").as_str(), "docs");
        assert_eq!(Label::sanitize("/data/docs/").as_str(), "docs");
        assert_eq!(Label::sanitize("C:\\Users\\me\\My Files\\").as_str(), "My_Files");
        assert_eq!(Label::sanitize("/srv/photos 2024.v2").as_str(), "photos_2024_v2");
    }

    #[test]
    fn test_sanitize_empty_segment() {
        assert_eq!(Label::sanitize("/").as_str(), "_");
        assert_eq!(Label::sanitize("").as_str(), "_");
    }

    #[test]
    fn test_sanitize_collision() {
        assert_eq!(Label::sanitize("/home/a/notes"), Label::sanitize("/mnt/b/notes"));
    }

    #[test]
    fn test_snapshot_name_format() {
        let name = SnapshotName::new(Label::sanitize("/data/docs"), at(7, 5, 3));
        assert_eq!(name.to_string(), "backup_docs_2024-03-09_07-05-03");
    }

    #[test]
    fn test_parse_for_label() {
        let label = Label::sanitize("docs");
        let parsed = SnapshotName::parse_for("backup_docs_2024-03-09_07-05-03", &label).unwrap();
        assert_eq!(parsed.timestamp(), at(7, 5, 3));

        assert!(SnapshotName::parse_for("backup_docs_2024-3-9_07-05-03", &label).is_none());
        assert!(SnapshotName::parse_for("backup_docs_latest", &label).is_none());
        assert!(SnapshotName::parse_for("backup_docs_2024-03-09_07-05-03.tmp", &label).is_none());
    }

    #[test]
    fn test_parse_for_rejects_longer_label() {
        // "docs_old" snapshots must not be listed under "docs".
        let label = Label::sanitize("docs");
        assert!(SnapshotName::parse_for("backup_docs_old_2024-03-09_07-05-03", &label).is_none());
    }

    #[test]
    fn test_parse_any_label() {
        let parsed = SnapshotName::parse("backup_docs_old_2024-03-09_07-05-03").unwrap();
        assert_eq!(parsed.label().as_str(), "docs_old");
        assert!(SnapshotName::parse("backup__2024-03-09_07-05-03").is_none());
        assert!(SnapshotName::parse("notes").is_none());
        assert!(SnapshotName::parse("backup_2024-03-09_07-05-03").is_none());
    }

    #[test]
    fn test_ordering_follows_time() {
        let label = Label::sanitize("docs");
        let older = SnapshotName::new(label.clone(), at(7, 5, 3));
        let newer = older.next_second();
        assert!(newer > older);
        assert!(newer.to_string() > older.to_string());
    }

    proptest! {
        #[test]
        fn prop_sanitize_is_idempotent(path in ".*") {
            let once = Label::sanitize(&path);
            let twice = Label::sanitize(once.as_str());
            prop_assert_eq!(&once, &twice);
            prop_assert!(Label::is_valid(once.as_str()));
        }

        #[test]
        fn prop_name_round_trips(
            label in "[A-Za-z0-9_-]{1,24}",
            secs in 0i64..4_000_000_000i64,
        ) {
            let ts = chrono::DateTime::from_timestamp(secs, 0).unwrap().naive_utc();
            let name = SnapshotName::new(Label::sanitize(&label), ts);
            let text = name.to_string();
            prop_assert_eq!(SnapshotName::parse_for(&text, name.label()), Some(name.clone()));
            prop_assert_eq!(SnapshotName::parse(&text), Some(name));
        }
    }
}
