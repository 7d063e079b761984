use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::table::{SlotId, TableSnapshot, WorkerView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Kill,
}

impl FromStr for Decision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" | "0" => Ok(Decision::Keep),
            "kill" | "1" => Ok(Decision::Kill),
            other => Err(anyhow!("unrecognised decision '{}': expected keep|kill|0|1", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub slot: SlotId,
    pub generation: u32,
    pub elapsed_secs: f64,
    pub features: Vec<f64>,
}

impl FeatureRow {
    pub fn from_worker(worker: &WorkerView, now: Instant) -> Self {
        Self {
            slot: worker.slot,
            generation: worker.generation,
            elapsed_secs: now.saturating_duration_since(worker.launched_at).as_secs_f64(),
            features: read_latest_features(&worker.feature_file),
        }
    }

    pub fn to_csv(&self) -> String {
        let mut cols = vec![
            self.slot.to_string(),
            self.generation.to_string(),
            format!("{:.3}", self.elapsed_secs),
        ];
        cols.extend(self.features.iter().map(|f| f.to_string()));
        cols.join(",")
    }
}

pub fn read_latest_features(path: &Path) -> Vec<f64> {
    let Ok(data) = fs::read_to_string(path) else {
        return Vec::new();
    };
    data.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|line| {
            line.split(',')
                .filter_map(|v| v.trim().parse::<f64>().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Decision source. Returns one decision per row, in row order. `scratch`
/// already holds the rows as CSV when this is called.
pub trait Predictor {
    fn predict(&mut self, scratch: &Path, rows: &[FeatureRow]) -> Result<Vec<Decision>>;
}

impl<F> Predictor for F
where
    F: FnMut(&[FeatureRow]) -> Result<Vec<Decision>>,
{
    fn predict(&mut self, _scratch: &Path, rows: &[FeatureRow]) -> Result<Vec<Decision>> {
        self(rows)
    }
}

#[derive(Debug, Clone)]
pub struct CommandPredictor {
    pub program: PathBuf,
    pub model: Option<PathBuf>,
}

impl Predictor for CommandPredictor {
    fn predict(&mut self, scratch: &Path, _rows: &[FeatureRow]) -> Result<Vec<Decision>> {
        let mut cmd = Command::new(&self.program);
        if let Some(model) = &self.model {
            cmd.arg("-model").arg(model);
        }
        cmd.arg("-file").arg(scratch);
        cmd.stdin(Stdio::null());
        cmd.stderr(Stdio::inherit());
        let output = cmd
            .output()
            .with_context(|| format!("running predictor {}", self.program.display()))?;
        if !output.status.success() {
            return Err(anyhow!(
                "predictor {} exited with {}",
                self.program.display(),
                output.status
            ));
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::parse)
            .collect()
    }
}

pub struct PruningPolicy {
    floor: usize,
    scratch: PathBuf,
    predictor: Box<dyn Predictor>,
}

impl std::fmt::Debug for PruningPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PruningPolicy")
            .field("floor", &self.floor)
            .field("scratch", &self.scratch)
            .finish_non_exhaustive()
    }
}

impl PruningPolicy {
    pub fn new(floor: usize, scratch: PathBuf, predictor: Box<dyn Predictor>) -> Self {
        Self {
            floor,
            scratch,
            predictor,
        }
    }

    pub fn floor(&self) -> usize {
        self.floor
    }

    /// Slots to kill this tick. Never more than `live - floor`; nothing at
    /// all while the pool is at or below the floor.
    pub fn evaluate(&mut self, snapshot: &TableSnapshot) -> Result<BTreeSet<SlotId>> {
        let live = snapshot.live_count();
        if live <= self.floor {
            debug!(live, floor = self.floor, "pool at floor, skipping prune");
            return Ok(BTreeSet::new());
        }
        let now = snapshot.taken_at.unwrap_or_else(Instant::now);
        let mut rows: Vec<FeatureRow> = snapshot
            .running()
            .map(|w| FeatureRow::from_worker(w, now))
            .collect();
        rows.sort_by_key(|r| r.slot);
        if rows.is_empty() {
            return Ok(BTreeSet::new());
        }

        write_scratch(&self.scratch, &rows)?;
        let decisions = self.predictor.predict(&self.scratch, &rows)?;
        if decisions.len() != rows.len() {
            return Err(anyhow!(
                "predictor returned {} decisions for {} rows",
                decisions.len(),
                rows.len()
            ));
        }

        let budget = live - self.floor;
        let flagged: Vec<SlotId> = rows
            .iter()
            .zip(&decisions)
            .filter(|(_, d)| **d == Decision::Kill)
            .map(|(r, _)| r.slot)
            .collect();
        if flagged.len() > budget {
            info!(
                flagged = flagged.len(),
                budget,
                "predictor flagged more workers than the floor allows"
            );
        }
        Ok(flagged.into_iter().take(budget).collect())
    }
}

fn write_scratch(path: &Path, rows: &[FeatureRow]) -> Result<()> {
    let mut body = String::new();
    for row in rows {
        body.push_str(&row.to_csv());
        body.push('\n');
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("scratch");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)
        .with_context(|| format!("creating scratch file {}", tmp.display()))?;
    file.write_all(body.as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{test_worker, WorkerState, WorkerTable};
    use std::os::unix::fs::PermissionsExt;

    fn table_with_running(n: u32) -> WorkerTable {
        let mut table = WorkerTable::new(n);
        for slot in 0..n {
            table.insert(test_worker(slot, slot)).expect("insert");
            table.transition(slot, WorkerState::Running).expect("promote");
        }
        table
    }

    fn kill_all(rows: &[FeatureRow]) -> Result<Vec<Decision>> {
        Ok(vec![Decision::Kill; rows.len()])
    }

    #[test]
    fn decisions_parse_words_and_digits() {
        assert_eq!("kill".parse::<Decision>().expect("kill"), Decision::Kill);
        assert_eq!(" KEEP ".parse::<Decision>().expect("keep"), Decision::Keep);
        assert_eq!("1".parse::<Decision>().expect("1"), Decision::Kill);
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn never_prunes_below_floor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut policy = PruningPolicy::new(5, dir.path().join("train.csv"), Box::new(kill_all));

        let six = table_with_running(6).snapshot();
        assert_eq!(policy.evaluate(&six).expect("evaluate").len(), 1);

        let five = table_with_running(5).snapshot();
        assert!(policy.evaluate(&five).expect("evaluate").is_empty());
    }

    #[test]
    fn flags_only_selected_running_workers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("train.csv");
        let mut table = table_with_running(10);
        table.transition(9, WorkerState::Completed).expect("complete");
        let predictor = |rows: &[FeatureRow]| -> Result<Vec<Decision>> {
            Ok(rows
                .iter()
                .map(|r| if r.slot == 2 || r.slot == 7 { Decision::Kill } else { Decision::Keep })
                .collect())
        };
        let mut policy = PruningPolicy::new(5, scratch.clone(), Box::new(predictor));
        let kills = policy.evaluate(&table.snapshot()).expect("evaluate");
        assert_eq!(kills.into_iter().collect::<Vec<_>>(), vec![2, 7]);

        let written = fs::read_to_string(&scratch).expect("scratch");
        let slots: Vec<&str> = written
            .lines()
            .map(|l| l.split(',').next().unwrap_or(""))
            .collect();
        assert_eq!(slots, vec!["0", "1", "2", "3", "4", "5", "6", "7", "8"]);
    }

    #[test]
    fn mismatched_decision_count_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let short = |_: &[FeatureRow]| -> Result<Vec<Decision>> { Ok(vec![Decision::Kill]) };
        let mut policy = PruningPolicy::new(1, dir.path().join("train.csv"), Box::new(short));
        assert!(policy.evaluate(&table_with_running(4).snapshot()).is_err());
    }

    #[test]
    fn feature_rows_use_last_numeric_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("train.csv.0.0");
        fs::write(&path, "1,2,3\n4.5, 6 ,x\n\n").expect("write");
        assert_eq!(read_latest_features(&path), vec![4.5, 6.0]);
        assert!(read_latest_features(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn command_predictor_reads_stdout_decisions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("predict.sh");
        fs::write(
            &script,
            "#!/bin/sh\n# -model M -file F\n[ \"$1\" = \"-model\" ] || exit 3\nwhile read -r line; do\n  case \"$line\" in 1,*) echo kill ;; *) echo keep ;; esac\ndone < \"$4\"\n",
        )
        .expect("write script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");

        let predictor = CommandPredictor {
            program: script,
            model: Some(dir.path().join("model.bin")),
        };
        let scratch = dir.path().join("train.csv");
        let mut policy = PruningPolicy::new(0, scratch, Box::new(predictor));
        let kills = policy
            .evaluate(&table_with_running(3).snapshot())
            .expect("evaluate");
        assert_eq!(kills.into_iter().collect::<Vec<_>>(), vec![1]);
    }
}
