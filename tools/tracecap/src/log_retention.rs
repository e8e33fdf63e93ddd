use crate::errors::TracecapError;
use std::fs;
use std::path::{Path, PathBuf};

/// Deletes the oldest `.jsonl` files in `dir` until the total size of the
/// remaining ones fits in `budget_bytes`. Files with other extensions are
/// never touched, so the log directory can be shared with record output.
pub fn enforce_total_budget(dir: &Path, budget_bytes: u64) -> Result<Vec<PathBuf>, TracecapError> {
    let mut logs = fs::read_dir(dir)
        .map_err(|e| TracecapError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_run_log(path))
        .filter_map(|path| {
            let meta = fs::metadata(&path).ok()?;
            Some((path, meta.len(), meta.modified().ok()))
        })
        .collect::<Vec<_>>();

    logs.sort_by(|(_, _, a), (_, _, b)| a.cmp(b));

    let mut total = logs.iter().map(|(_, len, _)| *len).sum::<u64>();
    let mut deleted = Vec::new();
    for (path, len, _) in logs {
        if total <= budget_bytes {
            break;
        }
        fs::remove_file(&path).map_err(|e| TracecapError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }

    Ok(deleted)
}

fn is_run_log(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("jsonl")
}

#[cfg(test)]
mod tests {
    use super::enforce_total_budget;
    use std::fs;

    #[test]
    fn prunes_oldest_logs_until_budget_is_met() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.jsonl"), vec![0u8; 40]).expect("a");
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.path().join("b.jsonl"), vec![0u8; 40]).expect("b");

        let deleted = enforce_total_budget(dir.path(), 50).expect("pruned");
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].ends_with("a.jsonl"));
    }

    #[test]
    fn leaves_non_log_files_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("kieker.map"), vec![0u8; 400]).expect("map");
        fs::write(dir.path().join("run.jsonl"), vec![0u8; 10]).expect("log");

        let deleted = enforce_total_budget(dir.path(), 50).expect("pruned");
        assert!(deleted.is_empty());
        assert!(dir.path().join("kieker.map").exists());
    }
}
