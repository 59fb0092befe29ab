//! On-disk artifacts of a stacking run.
//!
//! Every file is written to a temporary sibling and renamed into place, so
//! a failed unit never leaves a half-written file behind. Summary logs are
//! kept in memory and rewritten whole after each unit.

use crate::data::FeatureSetKind;
use crate::error::{Result, ToxError};
use crate::model::metrics::Curves;
use csv::{ReaderBuilder, Trim};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LEVEL1_SUMMARY: &str = "level1_summary.csv";
pub const LEVEL2_SUMMARY: &str = "level2_summary.csv";
pub const LEVEL1_AVERAGE: &str = "level1_average.csv";
pub const LEVEL2_AVERAGE: &str = "level2_average.csv";
pub const TRAIN_LABELS: &str = "level1_out_train_labels.csv";
pub const TEST_LABELS: &str = "level1_out_test_labels.csv";
pub const TRIAL_PREDICTIONS: &str = "final_predictions_predtrialdrugs.csv";
pub const TRIAL_VOTES: &str = "final_predictions_votes.csv";
pub const CURVES_DIR: &str = "prroc";

pub const LEVEL1_HEADER: &str = "RandomSeed,Data,Accuracy,AUROC,F1,Precision,Recall,MCC,Classifier";
pub const LEVEL2_HEADER: &str = "RandomSeed,Accuracy,AUROC,F1,Precision,Recall,MCC,Classifier";

/// Which side of the level-2 data a file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    Train,
    Test,
}

impl Part {
    pub fn as_str(&self) -> &'static str {
        match self {
            Part::Train => "train",
            Part::Test => "test",
        }
    }
}

/// Per-output meta-feature file, e.g. `sages-gridsk-3-level2_train.csv`
pub fn level1_meta_name(kind: FeatureSetKind, classifier: &str, seed: u64, part: Part) -> String {
    format!("{}-{}-{}-level2_{}.csv", kind, classifier, seed, part.as_str())
}

/// Stacked level-2 file of one seed, e.g. `3-level2_test.csv`
pub fn stacked_meta_name(seed: u64, part: Part) -> String {
    format!("{}-level2_{}.csv", seed, part.as_str())
}

pub fn level1_architecture_name(classifier: &str, kind: FeatureSetKind) -> String {
    format!("{}-{}-level1-architecture.json", classifier, kind)
}

pub fn level2_architecture_name(classifier: &str) -> String {
    format!("{}-level2-architecture.json", classifier)
}

pub fn trial_level1_name(seed: u64) -> String {
    format!("{}predtrialdrugs-level2.csv", seed)
}

/// Curves file under [`CURVES_DIR`]; `group` is a feature set, `all` or similar
pub fn curves_name(seed: u64, group: &str, classifier: &str) -> String {
    format!("{}/{}{}-{}-curves.csv", CURVES_DIR, seed, group, classifier)
}

/// Comma-join any displayable values
pub fn join<T: Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Writes artifacts under one output directory
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    /// Create the writer and its directories
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let curves = dir.join(CURVES_DIR);
        fs::create_dir_all(&curves).map_err(|e| ToxError::io(&curves, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Write `contents` to `name` via a temporary file and rename
    pub fn write(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let target = self.path(name);
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ToxError::config(format!("invalid artifact name '{}'", name)))?;
        let tmp = target.with_file_name(format!(".{}.tmp", file_name));

        fs::write(&tmp, contents).map_err(|e| ToxError::io(&tmp, e))?;
        fs::rename(&tmp, &target).map_err(|e| ToxError::io(&target, e))?;
        debug!("Wrote {:?}", target);
        Ok(target)
    }

    /// Write one line per entry
    pub fn write_lines(&self, name: &str, lines: &[String]) -> Result<PathBuf> {
        let mut contents = lines.join("\n");
        contents.push('\n');
        self.write(name, &contents)
    }

    /// Append one line to `name`, creating it if needed
    pub fn append_line(&self, name: &str, line: &str) -> Result<PathBuf> {
        use std::io::Write;

        let target = self.path(name);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .map_err(|e| ToxError::io(&target, e))?;
        writeln!(file, "{}", line).map_err(|e| ToxError::io(&target, e))?;
        Ok(target)
    }

    pub fn write_curves(&self, name: &str, curves: &Curves) -> Result<PathBuf> {
        let mut contents = curves.to_csv();
        contents.push('\n');
        self.write(name, &contents)
    }
}

/// CSV summary kept in memory and rewritten whole on every flush
#[derive(Debug, Clone)]
pub struct SummaryLog {
    name: String,
    header: String,
    rows: Vec<String>,
}

impl SummaryLog {
    pub fn new(name: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            header: header.into(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: String) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    pub fn to_csv(&self) -> String {
        let mut out = self.header.clone();
        out.push('\n');
        for row in &self.rows {
            out.push_str(row);
            out.push('\n');
        }
        out
    }

    /// Rewrite the file if a writer is present
    pub fn flush(&self, writer: Option<&ArtifactWriter>) -> Result<()> {
        if let Some(writer) = writer {
            writer.write(&self.name, &self.to_csv())?;
        }
        Ok(())
    }
}

/// Numeric rows of a comma-separated file; blank trailing cells are ignored
pub fn read_rows(path: &Path) -> Result<Vec<Vec<f64>>> {
    let file = fs::File::open(path).map_err(|e| ToxError::io(path, e))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(file);

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let line = record.position().map_or(0, |p| p.line());
        let row = record
            .iter()
            .filter(|cell| !cell.is_empty())
            .map(|cell| {
                cell.parse::<f64>().map_err(|_| {
                    ToxError::integrity(format!("{:?} line {}: bad value '{}'", path, line, cell))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }
    Ok(rows)
}

/// Label rows (one per seed) of a labels file
pub fn read_label_rows(path: &Path) -> Result<Vec<Vec<u8>>> {
    read_rows(path)?
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|v| match v {
                    v if v == 0.0 => Ok(0),
                    v if v == 1.0 => Ok(1),
                    other => Err(ToxError::integrity(format!(
                        "{:?}: label {} is not 0 or 1",
                        path, other
                    ))),
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_names() {
        assert_eq!(
            level1_meta_name(FeatureSetKind::Sages, "gridsk", 3, Part::Train),
            "sages-gridsk-3-level2_train.csv"
        );
        assert_eq!(stacked_meta_name(0, Part::Test), "0-level2_test.csv");
        assert_eq!(
            level1_architecture_name("gridsk", FeatureSetKind::Fingerprint),
            "gridsk-fp-level1-architecture.json"
        );
        assert_eq!(trial_level1_name(7), "7predtrialdrugs-level2.csv");
        assert_eq!(curves_name(2, "all", "average"), "prroc/2all-average-curves.csv");
    }

    #[test]
    fn test_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        writer.write_lines("a.csv", &["1,2".to_string(), "3,4".to_string()]).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("a.csv")).unwrap(), "1,2\n3,4\n");
        assert!(!dir.path().join(".a.csv.tmp").exists());
        assert!(dir.path().join(CURVES_DIR).is_dir());
    }

    #[test]
    fn test_summary_log_rewrites_whole_file() {
        let dir = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        let mut log = SummaryLog::new(LEVEL2_SUMMARY, LEVEL2_HEADER);

        log.push("0,1,1,1,1,1,1,x".to_string());
        log.flush(Some(&writer)).unwrap();
        log.push("1,0.5,0.5,0.5,0.5,0.5,0,x".to_string());
        log.flush(Some(&writer)).unwrap();

        let text = fs::read_to_string(dir.path().join(LEVEL2_SUMMARY)).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with(LEVEL2_HEADER));
    }

    #[test]
    fn test_read_rows_and_labels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.csv");
        fs::write(&path, "0.5,0.25,\n1,0\n\n").unwrap();
        assert_eq!(read_rows(&path).unwrap(), vec![vec![0.5, 0.25], vec![1.0, 0.0]]);

        let labels = dir.path().join("labels.csv");
        fs::write(&labels, "1,0,1\n0,0,1\n").unwrap();
        assert_eq!(read_label_rows(&labels).unwrap()[1], vec![0, 0, 1]);

        fs::write(&labels, "1,2\n").unwrap();
        assert!(matches!(read_label_rows(&labels), Err(ToxError::DataIntegrity(_))));

        fs::write(&path, "0.1,abc\n").unwrap();
        assert!(read_rows(&path).is_err());
    }

    #[test]
    fn test_read_rows_handles_quoting_and_padding() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.csv");
        fs::write(&path, "\"0.5\", 0.25 ,\n\n1,\"0\"\n").unwrap();
        assert_eq!(read_rows(&path).unwrap(), vec![vec![0.5, 0.25], vec![1.0, 0.0]]);

        let missing = dir.path().join("absent.csv");
        assert!(matches!(read_rows(&missing), Err(ToxError::Io { .. })));
    }
}
