//! Tn5 insertion-offset correction for BED intervals.
//!
//! Reads are shifted by strand so that interval ends mark the centre of the transposase
//! duplex. Records that are malformed or that would leave the chromosome are written to a
//! plain-text reject log and dropped.

use crate::errors::{AppError, Result};
use crate::genome::GenomeSizes;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

pub const PLUS_STRAND_SHIFT: i64 = 4;
pub const MINUS_STRAND_SHIFT: i64 = -5;

const STRAND_COLUMN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftOffsets {
    pub plus: i64,
    pub minus: i64,
}

impl Default for ShiftOffsets {
    fn default() -> Self {
        Self {
            plus: PLUS_STRAND_SHIFT,
            minus: MINUS_STRAND_SHIFT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShiftSummary {
    pub emitted: u64,
    pub malformed: u64,
    pub out_of_bounds: u64,
}

impl ShiftSummary {
    pub fn dropped(&self) -> u64 {
        self.malformed + self.out_of_bounds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Malformed,
    StartOutOfBounds,
    EndOutOfBounds,
}

impl Rejection {
    fn log_message(self) -> &'static str {
        match self {
            Self::Malformed => "Malformed BED line, skipping:",
            Self::StartOutOfBounds => "Shifted start lies outside chromosome bounds:",
            Self::EndOutOfBounds => "Shifted end lies outside chromosome bounds:",
        }
    }
}

/// Shifts `input_bed` into `output_bed`, appending rejected lines to `log_path`.
pub fn shift_bed_file(
    input_bed: &Path,
    output_bed: &Path,
    genome_sizes: &GenomeSizes,
    log_path: &Path,
    offsets: ShiftOffsets,
) -> Result<ShiftSummary> {
    info!(
        input = %input_bed.display(),
        output = %output_bed.display(),
        plus = offsets.plus,
        minus = offsets.minus,
        "shifting reads for Tn5 insertion offset"
    );
    let input =
        File::open(input_bed).map_err(|err| AppError::file("open BED", input_bed, err))?;
    let output =
        File::create(output_bed).map_err(|err| AppError::file("create BED", output_bed, err))?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|err| AppError::file("open shift log", log_path, err))?;
    let mut output = BufWriter::new(output);
    let mut log = BufWriter::new(log);

    let summary = shift_records(
        BufReader::new(input),
        &mut output,
        &mut log,
        genome_sizes,
        offsets,
    )?;
    output.flush()?;
    log.flush()?;

    if summary.dropped() > 0 {
        warn!(
            malformed = summary.malformed,
            out_of_bounds = summary.out_of_bounds,
            log = %log_path.display(),
            "dropped records while shifting"
        );
    }
    info!(emitted = summary.emitted, "finished shifting reads");
    Ok(summary)
}

/// Streams BED lines from `reader`, writing shifted records to `output` and rejects to `log`.
///
/// Lines that are not valid UTF-8 are rejected as malformed rather than aborting the stream.
pub fn shift_records<R, W, L>(
    mut reader: R,
    output: &mut W,
    log: &mut L,
    genome_sizes: &GenomeSizes,
    offsets: ShiftOffsets,
) -> Result<ShiftSummary>
where
    R: BufRead,
    W: Write + ?Sized,
    L: Write + ?Sized,
{
    let mut summary = ShiftSummary::default();
    let mut shifted = String::with_capacity(128);
    let mut raw = Vec::with_capacity(256);

    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }

        let Ok(line) = std::str::from_utf8(&raw) else {
            let lossy = String::from_utf8_lossy(&raw);
            reject(log, Rejection::Malformed, lossy.trim(), &mut summary)?;
            continue;
        };
        let record = line.trim();
        if record.is_empty() {
            continue;
        }

        match shift_line(record, genome_sizes, offsets, &mut shifted) {
            Ok(()) => {
                output.write_all(shifted.as_bytes())?;
                output.write_all(b"\n")?;
                summary.emitted += 1;
            }
            Err(rejection) => reject(log, rejection, record, &mut summary)?,
        }
    }

    Ok(summary)
}

fn reject<L: Write + ?Sized>(
    log: &mut L,
    rejection: Rejection,
    record: &str,
    summary: &mut ShiftSummary,
) -> Result<()> {
    writeln!(log, "{}", rejection.log_message())?;
    writeln!(log, "{record}")?;
    if rejection == Rejection::Malformed {
        summary.malformed += 1;
    } else {
        summary.out_of_bounds += 1;
    }
    Ok(())
}

fn shift_line(
    record: &str,
    genome_sizes: &GenomeSizes,
    offsets: ShiftOffsets,
    buffer: &mut String,
) -> std::result::Result<(), Rejection> {
    let fields = record.split('\t').collect::<Vec<_>>();
    if fields.len() <= STRAND_COLUMN {
        return Err(Rejection::Malformed);
    }

    let chrom = fields[0];
    let start = fields[1].parse::<i64>().map_err(|_| Rejection::Malformed)?;
    let end = fields[2].parse::<i64>().map_err(|_| Rejection::Malformed)?;
    let offset = match fields[STRAND_COLUMN] {
        "+" => offsets.plus,
        "-" => offsets.minus,
        _ => return Err(Rejection::Malformed),
    };

    let new_start = start
        .checked_add(offset)
        .filter(|position| genome_sizes.within_bounds(chrom, *position))
        .ok_or(Rejection::StartOutOfBounds)?;
    let new_end = end
        .checked_add(offset)
        .filter(|position| genome_sizes.within_bounds(chrom, *position))
        .ok_or(Rejection::EndOutOfBounds)?;

    buffer.clear();
    buffer.push_str(chrom);
    buffer.push('\t');
    buffer.push_str(&new_start.to_string());
    buffer.push('\t');
    buffer.push_str(&new_end.to_string());
    for field in &fields[3..] {
        buffer.push('\t');
        buffer.push_str(field);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ShiftOffsets, ShiftSummary, shift_bed_file, shift_records};
    use crate::genome::GenomeSizes;
    use std::fs;
    use std::io::Cursor;

    fn chr1_100() -> GenomeSizes {
        [("chr1".to_string(), 100)].into_iter().collect()
    }

    fn run(input: impl AsRef<[u8]>) -> (String, String, ShiftSummary) {
        let mut output = Vec::new();
        let mut log = Vec::new();
        let summary = shift_records(
            Cursor::new(input.as_ref()),
            &mut output,
            &mut log,
            &chr1_100(),
            ShiftOffsets::default(),
        )
        .expect("expected shift to succeed");
        (
            String::from_utf8(output).expect("expected utf8 output"),
            String::from_utf8(log).expect("expected utf8 log"),
            summary,
        )
    }

    #[test]
    fn shifts_plus_strand_forward_by_four() {
        let (output, log, summary) = run("chr1\t10\t20\tread1\t60\t+\n");
        assert_eq!(output, "chr1\t14\t24\tread1\t60\t+\n");
        assert!(log.is_empty());
        assert_eq!(summary.emitted, 1);
    }

    #[test]
    fn shifts_minus_strand_back_by_five_keeping_passthrough_fields() {
        let (output, _, _) = run("chr1\t10\t20\tname\t0\t-\n");
        assert_eq!(output, "chr1\t5\t15\tname\t0\t-\n");
    }

    #[test]
    fn drops_record_whose_end_passes_chromosome_length() {
        let (output, log, summary) = run("chr1\t96\t99\tname\t0\t+\n");
        assert!(output.is_empty());
        assert!(log.contains("chr1\t96\t99\tname\t0\t+"));
        assert_eq!(summary.out_of_bounds, 1);
    }

    #[test]
    fn drops_record_whose_start_falls_below_one() {
        let (output, log, _) = run("chr1\t3\t20\tname\t0\t-\n");
        assert!(output.is_empty());
        assert!(log.starts_with("Shifted start lies outside chromosome bounds:\n"));
    }

    #[test]
    fn logs_and_skips_unknown_strand() {
        let (output, log, summary) = run("chr1\t10\t20\tname\t0\t.\nchr1\t30\t40\tname\t0\t+\n");
        assert_eq!(output, "chr1\t34\t44\tname\t0\t+\n");
        assert!(log.contains("Malformed BED line"));
        assert!(log.contains("chr1\t10\t20\tname\t0\t."));
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.emitted, 1);
    }

    #[test]
    fn drops_records_on_chromosomes_missing_from_genome_sizes() {
        let (output, _, summary) = run("chrUn\t10\t20\tname\t0\t+\n");
        assert!(output.is_empty());
        assert_eq!(summary.out_of_bounds, 1);
    }

    #[test]
    fn truncated_records_are_malformed() {
        let (output, _, summary) = run("chr1\t10\t20\n");
        assert!(output.is_empty());
        assert_eq!(summary.malformed, 1);
    }

    #[test]
    fn non_utf8_line_is_logged_and_later_lines_still_shift() {
        let (output, log, summary) =
            run(b"chr1\t10\t20\tr\xff\xfe\t0\t+\nchr1\t30\t40\tok\t0\t+\n".as_slice());
        assert_eq!(output, "chr1\t34\t44\tok\t0\t+\n");
        assert!(log.starts_with("Malformed BED line, skipping:\n"));
        assert!(log.contains("chr1\t10\t20\tr"));
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.emitted, 1);
    }

    #[test]
    fn coordinates_that_overflow_when_shifted_are_out_of_bounds() {
        let (output, log, summary) = run(
            "chr1\t9223372036854775806\t9223372036854775807\tr\t0\t+\n\
             chr1\t-9223372036854775807\t10\tr\t0\t-\n\
             chr1\t10\t9223372036854775807\tr\t0\t+\n",
        );
        assert!(output.is_empty());
        assert_eq!(summary.out_of_bounds, 3);
        assert_eq!(
            log.matches("Shifted start lies outside chromosome bounds:").count(),
            2
        );
        assert_eq!(
            log.matches("Shifted end lies outside chromosome bounds:").count(),
            1
        );
    }

    #[test]
    fn rerunning_on_same_input_is_byte_identical() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let input = dir.path().join("unshifted.bed");
        fs::write(
            &input,
            "chr1\t10\t20\ta\t0\t+\nchr1\t96\t99\tb\t0\t+\nchr1\t50\t60\tc\t0\t-\n",
        )
        .expect("expected input write");
        let log = dir.path().join("shift_reads.logs");
        let first = dir.path().join("first.bed");
        let second = dir.path().join("second.bed");

        shift_bed_file(&input, &first, &chr1_100(), &log, ShiftOffsets::default())
            .expect("expected first shift");
        shift_bed_file(&input, &second, &chr1_100(), &log, ShiftOffsets::default())
            .expect("expected second shift");

        let first_bytes = fs::read(&first).expect("expected first output");
        assert_eq!(first_bytes, fs::read(&second).expect("expected second output"));
        assert_eq!(
            String::from_utf8(first_bytes).expect("expected utf8"),
            "chr1\t14\t24\ta\t0\t+\nchr1\t45\t55\tc\t0\t-\n"
        );

        let log_text = fs::read_to_string(&log).expect("expected log");
        assert_eq!(log_text.matches("chr1\t96\t99\tb\t0\t+").count(), 2);
    }
}
