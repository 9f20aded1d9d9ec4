use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum KnownSetError {
    #[error("failed to read known-set {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("malformed known-set {path} line {line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Pull request ids with the update time a previous partial output already
/// carries. Read-only for the duration of a run.
#[derive(Debug, Clone, Default)]
pub struct KnownSet {
    entries: HashMap<i64, DateTime<Utc>>,
}

impl KnownSet {
    /// Loads `id,updated_at` lines after a header row. A missing file is an
    /// empty set; later lines override earlier ones for the same id.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, KnownSetError> {
        let path = path.as_ref();
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(KnownSetError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let set = Self::parse(&raw).map_err(|(line, reason)| KnownSetError::Malformed {
            path: path.to_path_buf(),
            line,
            reason,
        })?;
        info!(path = %path.display(), entries = set.len(), "loaded known-set");
        Ok(set)
    }

    fn parse(raw: &str) -> Result<Self, (usize, String)> {
        let mut entries = HashMap::new();
        for (idx, line) in raw.lines().enumerate().skip(1) {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (id, updated_at) = line
                .split_once(',')
                .ok_or_else(|| (line_no, "expected `id,updated_at`".to_string()))?;
            let id: i64 = id
                .trim()
                .parse()
                .map_err(|err| (line_no, format!("bad id {id:?}: {err}")))?;
            let updated_at = DateTime::parse_from_rfc3339(updated_at.trim())
                .map_err(|err| (line_no, format!("bad timestamp {updated_at:?}: {err}")))?
                .with_timezone(&Utc);
            entries.insert(id, updated_at);
        }
        Ok(Self { entries })
    }

    pub fn contains(&self, id: i64, updated_at: DateTime<Utc>) -> bool {
        self.entries.get(&id) == Some(&updated_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(i64, DateTime<Utc>)> for KnownSet {
    fn from_iter<I: IntoIterator<Item = (i64, DateTime<Utc>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn last_occurrence_wins() {
        let set = KnownSet::parse(
            "id,updated_at\n\
             10,2024-01-01T00:00:00Z\n\
             \n\
             11,2024-01-02T00:00:00Z\n\
             10,2024-01-03T00:00:00+00:00\n",
        )
        .unwrap();
        assert_eq!(set.len(), 2);
        let jan = |d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap();
        assert!(set.contains(10, jan(3)));
        assert!(!set.contains(10, jan(1)));
        assert!(set.contains(11, jan(2)));
        assert!(!set.contains(12, jan(2)));
    }

    #[test]
    fn header_only_is_empty() {
        assert!(KnownSet::parse("id,updated_at\n").unwrap().is_empty());
        assert!(KnownSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_report_line_number() {
        let err = KnownSet::parse("id,updated_at\n1,2024-01-01T00:00:00Z\nabc,2024-01-01T00:00:00Z\n")
            .unwrap_err();
        assert_eq!(err.0, 3);

        let err = KnownSet::parse("id,updated_at\n1;2024\n").unwrap_err();
        assert_eq!(err.0, 2);

        let err = KnownSet::parse("id,updated_at\n1,yesterday\n").unwrap_err();
        assert!(err.1.contains("bad timestamp"));
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let set = KnownSet::load(dir.path().join("known.csv")).await.unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn load_names_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known.csv");
        std::fs::write(&path, "id,updated_at\nnope\n").unwrap();
        let err = KnownSet::load(&path).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("known.csv") && msg.contains("line 2"), "{msg}");
    }
}
