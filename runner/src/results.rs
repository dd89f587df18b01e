use crate::{
    collector::Instance,
    config::RunConfiguration,
    ingest::{FieldValue, SolverStats, Status},
};
use itertools::Itertools;
use std::{
    borrow::Cow,
    collections::BTreeSet,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::info;

/// stable leading columns of every snapshot, extra solver keys are appended
/// behind them in sorted order
pub const FIXED_COLUMNS: [&str; 12] = [
    "name",
    "V",
    "E",
    "upper_bound",
    "variables",
    "clauses",
    "status",
    "span",
    "encoding_time",
    "total_solving_time",
    "time_used",
    "memory_usage",
];

const REPORT_METRICS: [&str; 4] = [
    "encoding_time",
    "total_solving_time",
    "time_used",
    "memory_usage",
];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write snapshot")]
    Io(#[from] std::io::Error),
    #[error("checkpoint {path} is malformed: {reason}")]
    MalformedCheckpoint { path: PathBuf, reason: String },
}

/// Everything captured for one completed run.
/// Immutable after construction, owned by the aggregator after handoff.
#[derive(Debug, Clone)]
pub struct ResultRecord {
    fields: SolverStats,
}

impl ResultRecord {
    /// combine the parsed solver stats with what the supervisor measured
    pub fn from_run(instance: &Instance, mut stats: SolverStats, peak_rss_bytes: u64) -> Self {
        stats.insert(
            "name".to_string(),
            FieldValue::Str(instance.name.clone()),
        );

        let megabytes = peak_rss_bytes as f64 / (1024.0 * 1024.0);
        stats.insert(
            "memory_usage".to_string(),
            FieldValue::Float((megabytes * 1e5).round() / 1e5),
        );

        if let Some(bound) = instance.upper_bound {
            // the solver may echo the bound itself, its own value wins
            stats
                .entry("upper_bound".to_string())
                .or_insert(FieldValue::Int(bound));
        }

        Self { fields: stats }
    }

    fn from_fields(fields: SolverStats) -> Self {
        Self { fields }
    }

    pub fn name(&self) -> &str {
        self.fields
            .get("name")
            .and_then(FieldValue::as_str)
            .unwrap_or("")
    }

    pub fn status_label(&self) -> Option<&str> {
        self.fields.get("status").and_then(FieldValue::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn numeric(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(FieldValue::as_f64)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// Append-only table of all completed runs of the batch.
/// Uniqueness of names is guaranteed by filtering at collection time, the
/// table itself never dedups.
#[derive(Debug, Default)]
pub struct ResultTable {
    records: Vec<ResultRecord>,
    names: BTreeSet<String>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: ResultRecord) {
        self.names.insert(record.name().to_string());
        self.records.push(record);
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    /// fixed columns first, then every extra solver key seen in the batch
    pub fn columns(&self) -> Vec<String> {
        let mut columns = FIXED_COLUMNS.iter().map(|c| c.to_string()).collect_vec();

        let extras = self
            .records
            .iter()
            .flat_map(ResultRecord::keys)
            .filter(|key| !FIXED_COLUMNS.contains(key))
            .unique()
            .sorted()
            .map(str::to_string)
            .collect_vec();
        columns.extend(extras);

        columns
    }

    pub fn write_csv(&self, sink: &mut impl Write) -> Result<(), ExportError> {
        let columns = self.columns();
        writeln!(sink, "{}", columns.iter().map(|c| escape_cell(c)).join(","))?;

        for record in &self.records {
            let row = columns
                .iter()
                .map(|column| {
                    record
                        .get(column)
                        .map(|value| escape_cell(&value.to_string()).into_owned())
                        .unwrap_or_default()
                })
                .join(",");
            writeln!(sink, "{row}")?;
        }

        Ok(())
    }

    /// reduce the table to counts per status label and min/max/average of
    /// the timing and memory fields, transposed to a `metric,value` file
    pub fn write_report(&self, sink: &mut impl Write) -> Result<(), ExportError> {
        writeln!(sink, "metric,value")?;

        for label in Status::LABELS {
            let count = self
                .records
                .iter()
                .filter(|record| record.status_label() == Some(label))
                .count();
            writeln!(sink, "{label},{count}")?;
        }

        for metric in REPORT_METRICS {
            let values = self
                .records
                .iter()
                .filter_map(|record| record.numeric(metric))
                .collect_vec();

            if values.is_empty() {
                writeln!(sink, "average_{metric},")?;
                writeln!(sink, "max_{metric},")?;
                writeln!(sink, "min_{metric},")?;
                continue;
            }

            let sum: f64 = values.iter().sum();
            let max = values.iter().cloned().fold(f64::MIN, f64::max);
            let min = values.iter().cloned().fold(f64::MAX, f64::min);
            writeln!(sink, "average_{metric},{}", sum / values.len() as f64)?;
            writeln!(sink, "max_{metric},{max}")?;
            writeln!(sink, "min_{metric},{min}")?;
        }

        Ok(())
    }

    /// seed a table from a previously exported snapshot to resume a batch
    pub fn load_csv(path: &Path) -> Result<Self, ExportError> {
        let content = fs::read_to_string(path)?;
        let mut lines = content.lines();

        let header = lines.next().ok_or_else(|| ExportError::MalformedCheckpoint {
            path: path.to_path_buf(),
            reason: "empty file".to_string(),
        })?;
        let columns = split_row(header);

        let mut table = Self::new();
        for (number, line) in lines.enumerate() {
            if line.is_empty() {
                continue;
            }

            let cells = split_row(line);
            if cells.len() != columns.len() {
                return Err(ExportError::MalformedCheckpoint {
                    path: path.to_path_buf(),
                    reason: format!(
                        "row {} has {} cells but the header has {} columns",
                        number + 2,
                        cells.len(),
                        columns.len()
                    ),
                });
            }

            let mut fields = SolverStats::new();
            for (column, cell) in columns.iter().zip(cells) {
                if cell.is_empty() {
                    continue;
                }

                // names and status labels must survive as text, a purely
                // numeric instance name must not come back as an integer
                let value = if column == "name" || column == "status" {
                    FieldValue::Str(cell)
                } else {
                    FieldValue::parse(&cell)
                };
                fields.insert(column.clone(), value);
            }

            table.append(ResultRecord::from_fields(fields));
        }

        Ok(table)
    }
}

/// Owns the result table and its durability.
///
/// Appends completed records, writes a `partial` snapshot whenever the save
/// interval elapsed and a tagged final snapshot when the batch ends.
pub struct Aggregator {
    table: ResultTable,
    run: RunConfiguration,
    result_dir: PathBuf,
    save_interval: Duration,
    last_save: Instant,
}

impl Aggregator {
    pub fn new(
        run: RunConfiguration,
        result_dir: PathBuf,
        save_interval: Duration,
        seed: ResultTable,
    ) -> Self {
        Self {
            table: seed,
            run,
            result_dir,
            save_interval,
            last_save: Instant::now(),
        }
    }

    pub fn table(&self) -> &ResultTable {
        &self.table
    }

    /// take ownership of a completed record, periodically flushing a
    /// partial snapshot so a dying batch never loses finished work
    pub fn append(&mut self, record: ResultRecord) -> Result<(), ExportError> {
        self.table.append(record);

        if self.last_save.elapsed() >= self.save_interval {
            self.export(Some("partial"))?;
            self.last_save = Instant::now();
        }

        Ok(())
    }

    /// whole-table rewrite to durable storage, tagged by why it was taken
    pub fn export(&self, suffix: Option<&str>) -> Result<PathBuf, ExportError> {
        fs::create_dir_all(&self.result_dir)?;

        let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
        let suffix = suffix.map(|s| format!("_{s}")).unwrap_or_default();
        let stem = self.run.result_stem();

        let table_path = self.result_dir.join(format!("{stem}{suffix}_{timestamp}.csv"));
        let report_path = self
            .result_dir
            .join(format!("report_{stem}{suffix}_{timestamp}.csv"));

        let mut table_sink = BufWriter::new(File::create(&table_path)?);
        self.table.write_csv(&mut table_sink)?;
        table_sink.flush()?;

        let mut report_sink = BufWriter::new(File::create(&report_path)?);
        self.table.write_report(&mut report_sink)?;
        report_sink.flush()?;

        info!(
            "Exported {} records to {}",
            self.table.len(),
            table_path.to_string_lossy()
        );

        Ok(table_path)
    }
}

fn escape_cell(cell: &str) -> Cow<'_, str> {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') {
        Cow::Owned(format!("\"{}\"", cell.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(cell)
    }
}

fn split_row(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            '"' => quoted = !quoted,
            ',' if !quoted => cells.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    cells.push(current);

    cells
}
