use crate::data::{FeatureSetKind, Matrix};
use crate::error::{Result, ToxError};
use csv::ReaderBuilder;
use flate2::read::GzDecoder;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    Csv,
    Tsv,
    GzippedCsv,
    GzippedTsv,
}

impl FileFormat {
    /// Detect file format from path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str());
        let stem = path.file_stem().and_then(|s| s.to_str());

        match (ext, stem) {
            (Some("gz"), Some(stem)) => {
                if stem.ends_with(".csv") {
                    Ok(FileFormat::GzippedCsv)
                } else if stem.ends_with(".tsv") || stem.ends_with(".txt") {
                    Ok(FileFormat::GzippedTsv)
                } else {
                    Err(ToxError::config(format!(
                        "cannot determine format of gzipped file {:?}",
                        path
                    )))
                }
            }
            (Some("csv"), _) => Ok(FileFormat::Csv),
            (Some("tsv"), _) | (Some("txt"), _) => Ok(FileFormat::Tsv),
            _ => Err(ToxError::config(format!("unsupported file format: {:?}", path))),
        }
    }

    /// Get delimiter character
    pub fn delimiter(&self) -> u8 {
        match self {
            FileFormat::Csv | FileFormat::GzippedCsv => b',',
            FileFormat::Tsv | FileFormat::GzippedTsv => b'\t',
        }
    }

    /// Check if format is gzipped
    pub fn is_gzipped(&self) -> bool {
        matches!(self, FileFormat::GzippedCsv | FileFormat::GzippedTsv)
    }
}

/// Open a plain or gzipped table for reading
fn open_table(path: &Path) -> Result<(Box<dyn Read>, FileFormat)> {
    let format = FileFormat::from_path(path)?;
    debug!("Detected file format for {:?}: {:?}", path, format);

    let file = File::open(path).map_err(|e| ToxError::io(path, e))?;
    let reader: Box<dyn Read> = if format.is_gzipped() {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok((reader, format))
}

/// Parse a feature cell, treating anything non-numeric as 0
pub fn parse_lenient(cell: &str) -> f64 {
    cell.trim().parse::<f64>().unwrap_or(0.0)
}

/// Per-drug binary endpoints
///
/// The first row is a header and the first column holds the drug
/// identifier; identifiers are lower-cased on load.
#[derive(Debug, Clone)]
pub struct LabelTable {
    /// Header row, including the identifier column
    pub header: Vec<String>,
    /// `(identifier, full row)` in file order
    rows: Vec<(String, Vec<String>)>,
}

impl LabelTable {
    /// Load label table from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading labels from {:?}", path);
        let (reader, format) = open_table(path)?;
        let table = Self::parse(reader, format.delimiter())?;
        info!("Loaded {} labeled drugs", table.len());
        Ok(table)
    }

    /// Parse label table from reader
    pub fn parse<R: Read>(reader: R, delimiter: u8) -> Result<Self> {
        let mut csv_reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let header = csv_reader
            .headers()?
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        for (line, result) in csv_reader.records().enumerate() {
            let record = result?;
            let cells: Vec<String> = record.iter().map(|s| s.to_string()).collect();
            let Some(id) = cells.first() else {
                continue;
            };
            let key = id.to_lowercase();
            if !seen.insert(key.clone()) {
                return Err(ToxError::integrity(format!(
                    "label row {}: drug '{}' is listed more than once",
                    line + 2,
                    id
                )));
            }
            rows.push((key, cells));
        }

        Ok(Self { header, rows })
    }

    /// Number of drugs
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no drugs
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Split drugs into `(positive, negative)` pools by an endpoint column
    ///
    /// Column 0 is the identifier, so `endpoint` must be at least 1. A cell
    /// equal to `"1"` marks a positive drug; any other value is negative.
    pub fn pools(&self, endpoint: usize) -> Result<(Vec<String>, Vec<String>)> {
        if endpoint == 0 {
            return Err(ToxError::config(
                "endpoint column 0 is the drug identifier",
            ));
        }

        let mut positive = Vec::new();
        let mut negative = Vec::new();
        for (line, (id, cells)) in self.rows.iter().enumerate() {
            let cell = cells.get(endpoint).ok_or_else(|| {
                ToxError::integrity(format!(
                    "label row {} ({}) has no endpoint column {}",
                    line + 2,
                    id,
                    endpoint
                ))
            })?;
            if cell.trim() == "1" {
                positive.push(id.clone());
            } else {
                negative.push(id.clone());
            }
        }

        debug!(
            "Endpoint {}: positive={}, negative={}",
            endpoint,
            positive.len(),
            negative.len()
        );
        Ok((positive, negative))
    }
}

/// Headerless numeric table keyed by drug identifier
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    /// Where the table came from, used in error messages
    pub source: String,
    /// Identifiers in file order, original case
    ids: Vec<String>,
    /// Lower-cased identifier to row index
    index: HashMap<String, usize>,
    values: Vec<Vec<f64>>,
}

impl FeatureTable {
    /// Load feature table from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading features from {:?}", path);
        let (reader, format) = open_table(path)?;
        let table = Self::parse(reader, format.delimiter(), path.display().to_string())?;
        info!("Loaded {} feature rows from {:?}", table.len(), path);
        Ok(table)
    }

    /// Parse feature table from reader
    pub fn parse<R: Read>(reader: R, delimiter: u8, source: impl Into<String>) -> Result<Self> {
        let mut csv_reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut table = Self {
            source: source.into(),
            ..Self::default()
        };

        for result in csv_reader.records() {
            let record = result?;
            let Some(id) = record.get(0) else {
                continue;
            };
            let row: Vec<f64> = record.iter().skip(1).map(parse_lenient).collect();
            table.insert(id, row);
        }

        Ok(table)
    }

    /// Insert a row; a repeated identifier replaces the earlier row
    pub fn insert(&mut self, id: &str, row: Vec<f64>) {
        let key = id.to_lowercase();
        match self.index.get(&key) {
            Some(&i) => {
                warn!("Duplicate drug '{}' in {}, keeping last row", id, self.source);
                self.values[i] = row;
            }
            None => {
                self.index.insert(key, self.ids.len());
                self.ids.push(id.to_string());
                self.values.push(row);
            }
        }
    }

    /// Number of drugs
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the table has no drugs
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Identifiers in file order
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Matrix whose rows follow `drugs` exactly
    pub fn matrix(&self, drugs: &[String]) -> Result<Matrix> {
        let rows = drugs
            .iter()
            .map(|drug| {
                self.index
                    .get(&drug.to_lowercase())
                    .map(|&i| &self.values[i])
                    .ok_or_else(|| {
                        ToxError::integrity(format!(
                            "drug '{}' missing from {}",
                            drug, self.source
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        self.stack(&rows)
    }

    /// Every row in file order
    pub fn full_matrix(&self) -> Result<Matrix> {
        let rows: Vec<&Vec<f64>> = self.values.iter().collect();
        self.stack(&rows)
    }

    fn stack(&self, rows: &[&Vec<f64>]) -> Result<Matrix> {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut flat = Vec::with_capacity(rows.len() * width);
        for row in rows {
            if row.len() != width {
                return Err(ToxError::integrity(format!(
                    "ragged rows in {}: expected {} columns, found {}",
                    self.source,
                    width,
                    row.len()
                )));
            }
            flat.extend_from_slice(row);
        }
        Matrix::from_shape_vec((rows.len(), width), flat)
            .map_err(|e| ToxError::integrity(format!("{}: {}", self.source, e)))
    }
}

/// Drugs in active clinical trials with their feature matrices
#[derive(Debug, Clone)]
pub struct TrialCohort {
    /// Drug names in file order
    pub drugs: Vec<String>,
    /// One matrix per feature set, rows parallel to `drugs`
    pub sets: BTreeMap<FeatureSetKind, Matrix>,
}

impl TrialCohort {
    /// Load every trial table and check that they list the same drugs
    pub fn load(paths: &BTreeMap<FeatureSetKind, PathBuf>) -> Result<Self> {
        let mut drugs: Option<Vec<String>> = None;
        let mut sets = BTreeMap::new();

        for (&kind, path) in paths {
            let table = FeatureTable::load(path)?;
            match &drugs {
                None => drugs = Some(table.ids().to_vec()),
                Some(existing) => {
                    let same = existing.len() == table.len()
                        && existing
                            .iter()
                            .zip(table.ids())
                            .all(|(a, b)| a.to_lowercase() == b.to_lowercase());
                    if !same {
                        return Err(ToxError::integrity(format!(
                            "trial table {:?} lists different drugs than the other trial tables",
                            path
                        )));
                    }
                }
            }
            sets.insert(kind, table.full_matrix()?);
        }

        let drugs = drugs.unwrap_or_default();
        info!("Loaded {} trial drugs across {} feature sets", drugs.len(), sets.len());
        Ok(Self { drugs, sets })
    }
}
