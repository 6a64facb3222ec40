//! Quality-control metrics collected while the stages run.
//!
//! Scraping is best-effort: a report that cannot be opened or parsed becomes a
//! [`Metric::Unavailable`] or [`Metric::Unparseable`] entry instead of an error, so a
//! genuine zero stays distinguishable from a missing value.

use crate::errors::{AppError, Result};
use crate::shift::ShiftSummary;
use crate::steric::FilterSummary;
use flate2::read::MultiGzDecoder;
use regex::Regex;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

const FASTQ_LINES_PER_RECORD: u64 = 4;
const DUPLICATE_METRICS_FIELDS: usize = 9;
const PERCENT_DUPLICATION_COLUMN: usize = 7;

static FLAGSTAT_MAPPED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) \+ \d+ mapped").expect("flagstat mapped pattern is a valid regex")
});
static LEADING_DIGITS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+").expect("leading digits pattern is a valid regex")
});

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric<T> {
    Value(T),
    /// The source was read but did not contain the expected value.
    Unparseable(String),
    /// The source could not be read at all.
    Unavailable(String),
    /// The stage producing this metric did not run.
    #[default]
    NotCollected,
}

impl<T> Metric<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_collected(&self) -> bool {
        !matches!(self, Self::NotCollected)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReadPairCounts {
    pub read1: Metric<u64>,
    pub read2: Metric<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QcMetrics {
    pub total_raw_reads_counts: Vec<ReadPairCounts>,
    pub trimmed_reads_counts: Vec<ReadPairCounts>,
    pub num_reads_mapped: Vec<Metric<u64>>,
    pub percent_duplicate_reads: Metric<f64>,
    pub steric_filter: Metric<FilterSummary>,
    pub shifted_reads: Metric<ShiftSummary>,
    pub num_peaks_called: Metric<u64>,
}

impl QcMetrics {
    /// Folds the metrics a stage returned into the run-wide record.
    pub fn merge(&mut self, other: QcMetrics) {
        self.total_raw_reads_counts
            .extend(other.total_raw_reads_counts);
        self.trimmed_reads_counts.extend(other.trimmed_reads_counts);
        self.num_reads_mapped.extend(other.num_reads_mapped);
        merge_scalar(
            &mut self.percent_duplicate_reads,
            other.percent_duplicate_reads,
        );
        merge_scalar(&mut self.steric_filter, other.steric_filter);
        merge_scalar(&mut self.shifted_reads, other.shifted_reads);
        merge_scalar(&mut self.num_peaks_called, other.num_peaks_called);
    }

    /// Writes the record as pretty JSON, replacing any previous file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|err| AppError::file("create QC file", path, err))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).map_err(std::io::Error::from)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

fn merge_scalar<T>(current: &mut Metric<T>, incoming: Metric<T>) {
    if incoming.is_collected() {
        *current = incoming;
    }
}

/// Counts FASTQ records in a gzip-compressed file as `lines / 4`.
pub fn count_gzipped_fastq_reads(path: &Path) -> Metric<u64> {
    match File::open(path).and_then(|file| count_lines(MultiGzDecoder::new(file))) {
        Ok(lines) => Metric::Value(lines / FASTQ_LINES_PER_RECORD),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not count FASTQ reads");
            Metric::Unavailable(format!("could not count reads in {}: {err}", path.display()))
        }
    }
}

fn count_lines<R: Read>(reader: R) -> std::io::Result<u64> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut lines = 0_u64;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        if buf.last() == Some(&b'\n') {
            lines += 1;
        }
    }
    Ok(lines)
}

/// Mapped read pairs from a `samtools flagstat` report (mapped reads / 2).
pub fn scrape_flagstat_mapped_pairs(path: &Path) -> Metric<u64> {
    match fs::read_to_string(path) {
        Ok(contents) => parse_flagstat_mapped_pairs(&contents).map_or_else(
            || Metric::Unparseable(format!("no mapped count line in {}", path.display())),
            Metric::Value,
        ),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not open flagstat report");
            Metric::Unavailable(format!("could not open flagstat {}: {err}", path.display()))
        }
    }
}

pub fn parse_flagstat_mapped_pairs(contents: &str) -> Option<u64> {
    FLAGSTAT_MAPPED
        .captures(contents)
        .and_then(|captures| captures.get(1))
        .and_then(|count| count.as_str().parse::<u64>().ok())
        .map(|mapped| mapped / 2)
}

/// Duplication rate from a duplicate-marker metrics report.
pub fn scrape_duplicate_rate(path: &Path) -> Metric<f64> {
    match File::open(path) {
        Ok(file) => match parse_duplicate_rate(BufReader::new(file)) {
            Ok(Some(rate)) => Metric::Value(rate),
            Ok(None) => {
                Metric::Unparseable(format!("no duplication rate row in {}", path.display()))
            }
            Err(err) => Metric::Unavailable(format!(
                "could not read duplicate metrics {}: {err}",
                path.display()
            )),
        },
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not open duplicate metrics");
            Metric::Unavailable(format!(
                "could not open duplicate metrics {}: {err}",
                path.display()
            ))
        }
    }
}

/// Takes column 8 of the first non-comment, 9-column row whose value starts with a digit.
pub fn parse_duplicate_rate<R: BufRead>(reader: R) -> std::io::Result<Option<f64>> {
    for line in reader.lines() {
        let line = line?;
        if line.starts_with('#') {
            continue;
        }
        let fields = line.trim().split('\t').collect::<Vec<_>>();
        if fields.len() != DUPLICATE_METRICS_FIELDS {
            continue;
        }
        let raw = fields[PERCENT_DUPLICATION_COLUMN];
        if !LEADING_DIGITS.is_match(raw) {
            continue;
        }
        return Ok(raw.parse::<f64>().ok());
    }
    Ok(None)
}

/// Number of non-empty lines in the final peak set.
pub fn count_peaks(path: &Path) -> Metric<u64> {
    match File::open(path) {
        Ok(file) => {
            let mut peaks = 0_u64;
            for line in BufReader::new(file).lines() {
                match line {
                    Ok(line) if !line.trim().is_empty() => peaks += 1,
                    Ok(_) => {}
                    Err(err) => {
                        return Metric::Unavailable(format!(
                            "could not read peaks {}: {err}",
                            path.display()
                        ));
                    }
                }
            }
            Metric::Value(peaks)
        }
        Err(err) => Metric::Unavailable(format!("could not open peaks {}: {err}", path.display())),
    }
}
