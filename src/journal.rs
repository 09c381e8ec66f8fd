//! Results a referee could not deliver to the League Manager.
//!
//! Kept for manual reconciliation, either in memory or appended as JSON lines to a file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{error, info};

use crate::protocol::MatchResultReport;

enum Sink {
    Memory,
    File(PathBuf),
}

/// Append-only store of undelivered [`MatchResultReport`]s.
pub struct ResultJournal {
    sink: Sink,
    entries: Mutex<Vec<MatchResultReport>>,
}

impl ResultJournal {
    pub fn in_memory() -> ResultJournal {
        ResultJournal {
            sink: Sink::Memory,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Appends to `path`, created on first write.
    pub fn at_path(path: impl AsRef<Path>) -> ResultJournal {
        ResultJournal {
            sink: Sink::File(path.as_ref().to_path_buf()),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Stores `report`. The in-memory copy is kept even if the file write fails.
    pub async fn persist(&self, report: &MatchResultReport) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.push(report.clone());
        if let Sink::File(path) = &self.sink {
            if let Err(e) = append_line(path, report).await {
                error!(match_id = %report.match_id, path = %path.display(), "could not journal result: {e:#}");
                return Err(e);
            }
        }
        info!(match_id = %report.match_id, "result journaled for reconciliation");
        Ok(())
    }

    /// Everything journaled by this instance.
    pub async fn pending(&self) -> Vec<MatchResultReport> {
        self.entries.lock().await.clone()
    }

    /// Reads back a journal file.
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Vec<MatchResultReport>> {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(e).with_context(|| format!("could not read {}", path.display()))
            }
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("{}: invalid entry on line {}", path.display(), i + 1))
            })
            .collect()
    }
}

async fn append_line(path: &Path, report: &MatchResultReport) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(report).context("could not encode report")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("could not open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .await
        .with_context(|| format!("could not write {}", path.display()))?;
    file.flush().await.context("could not flush journal")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{PlayerId, RefereeId};
    use crate::protocol::MatchOutcome;

    fn report(match_id: &str) -> MatchResultReport {
        MatchResultReport {
            match_id: match_id.into(),
            round_number: 1,
            referee_id: RefereeId(1),
            player_a: PlayerId(1),
            player_b: PlayerId(2),
            outcome: MatchOutcome::Draw,
            score_a: 1,
            score_b: 1,
            rounds: vec![],
            forfeits: vec![],
        }
    }

    #[tokio::test]
    async fn memory_journal_keeps_order() {
        let journal = ResultJournal::in_memory();
        journal.persist(&report("R1M1")).await.unwrap();
        journal.persist(&report("R1M2")).await.unwrap();
        let ids: Vec<_> = journal.pending().await.into_iter().map(|r| r.match_id).collect();
        assert_eq!(ids, ["R1M1", "R1M2"]);
    }

    #[tokio::test]
    async fn file_journal_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");

        let journal = ResultJournal::at_path(&path);
        journal.persist(&report("R1M1")).await.unwrap();
        drop(journal);
        let journal = ResultJournal::at_path(&path);
        journal.persist(&report("R2M1")).await.unwrap();

        let loaded = ResultJournal::load(&path).await.unwrap();
        assert_eq!(loaded, vec![report("R1M1"), report("R2M1")]);
        assert_eq!(journal.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ResultJournal::load(dir.path().join("none.jsonl"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let journal = ResultJournal::at_path(dir.path().join("missing_dir").join("r.jsonl"));
        assert!(journal.persist(&report("R1M1")).await.is_err());
        assert_eq!(journal.pending().await.len(), 1);
    }
}
