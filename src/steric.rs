use crate::errors::{AppError, Result};
use rust_htslib::bam;
use rust_htslib::bam::Read;
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Fragments shorter than the Tn5 footprint cannot come from two independent insertions.
pub const STERIC_HINDRANCE_CUTOFF: i64 = 38;

/// `SAMtools` flag masks used by the post-processing filters.
pub const SECONDARY_FLAG: u16 = 0x100;
pub const UNMAPPED_OR_MATE_UNMAPPED_FLAGS: u16 = 0x4 | 0x8;
pub const MIN_UNIQUE_MAPQ: u8 = 10;

const CHROMOSOME_PREFIX: &str = "chr";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterSummary {
    pub kept: u64,
    pub dropped: u64,
}

pub fn passes_steric_filter(template_length: i64, cutoff: i64) -> bool {
    template_length.abs() >= cutoff
}

/// Copies `input_bam` to `output_bam`, keeping only records with `|TLEN| >= cutoff`.
///
/// The header is carried over unchanged and survivors keep their input order.
pub fn filter_by_fragment_length(
    input_bam: &Path,
    output_bam: &Path,
    cutoff: i64,
) -> Result<FilterSummary> {
    let mut reader = bam::Reader::from_path(input_bam)
        .map_err(|err| AppError::bam("open reader", input_bam, err))?;
    let header = bam::Header::from_template(reader.header());
    let mut writer = bam::Writer::from_path(output_bam, &header, bam::Format::Bam)
        .map_err(|err| AppError::bam("open writer", output_bam, err))?;

    let mut summary = FilterSummary::default();
    let mut record = bam::Record::new();
    while let Some(result) = reader.read(&mut record) {
        result.map_err(|err| AppError::bam("record read", input_bam, err))?;

        if !passes_steric_filter(record.insert_size(), cutoff) {
            summary.dropped += 1;
            continue;
        }
        writer
            .write(&record)
            .map_err(|err| AppError::bam("record write", output_bam, err))?;
        summary.kept += 1;
    }

    info!(
        input = %input_bam.display(),
        output = %output_bam.display(),
        cutoff,
        kept = summary.kept,
        dropped = summary.dropped,
        "applied steric hindrance filter"
    );
    Ok(summary)
}

/// Nuclear chromosomes kept after mitochondrial removal: `chr1..chr22`, `chrX`, `chrY`.
pub fn allowed_chromosomes() -> Vec<String> {
    (1..=22)
        .map(|index| index.to_string())
        .chain(["X".to_string(), "Y".to_string()])
        .map(|suffix| format!("{CHROMOSOME_PREFIX}{suffix}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{
        STERIC_HINDRANCE_CUTOFF, allowed_chromosomes, filter_by_fragment_length,
        passes_steric_filter,
    };
    use rust_htslib::bam;
    use rust_htslib::bam::Read;
    use rust_htslib::bam::header::HeaderRecord;
    use rust_htslib::bam::record::{Cigar, CigarString};
    use std::path::Path;

    fn write_fixture(path: &Path, template_lengths: &[i64]) {
        let mut header = bam::Header::new();
        let mut hd = HeaderRecord::new(b"HD");
        hd.push_tag(b"VN", "1.6");
        hd.push_tag(b"SO", "coordinate");
        header.push_record(&hd);
        let mut sq = HeaderRecord::new(b"SQ");
        sq.push_tag(b"SN", "chr1");
        sq.push_tag(b"LN", 10_000);
        header.push_record(&sq);

        let mut writer = bam::Writer::from_path(path, &header, bam::Format::Bam)
            .expect("expected fixture writer");
        let cigar = CigarString(vec![Cigar::Match(4)]);
        for (index, tlen) in template_lengths.iter().enumerate() {
            let mut record = bam::Record::new();
            let qname = format!("frag{index}");
            record.set(qname.as_bytes(), Some(&cigar), b"ACGT", &[30, 30, 30, 30]);
            record.set_tid(0);
            record.set_pos(100 + index as i64 * 10);
            record.set_mtid(0);
            record.set_mpos(200);
            record.set_mapq(60);
            record.set_flags(0x1 | 0x2);
            record.set_insert_size(*tlen);
            writer.write(&record).expect("expected fixture record write");
        }
    }

    fn read_back(path: &Path) -> Vec<(String, i64)> {
        let mut reader = bam::Reader::from_path(path).expect("expected output reader");
        reader
            .records()
            .map(|record| {
                let record = record.expect("expected readable record");
                (
                    String::from_utf8_lossy(record.qname()).into_owned(),
                    record.insert_size(),
                )
            })
            .collect()
    }

    #[test]
    fn threshold_is_inclusive_on_absolute_length() {
        assert!(passes_steric_filter(38, STERIC_HINDRANCE_CUTOFF));
        assert!(passes_steric_filter(-38, STERIC_HINDRANCE_CUTOFF));
        assert!(!passes_steric_filter(37, STERIC_HINDRANCE_CUTOFF));
        assert!(!passes_steric_filter(0, STERIC_HINDRANCE_CUTOFF));
    }

    #[test]
    fn keeps_long_fragments_in_input_order() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let input = dir.path().join("sortmerged.bam");
        let output = dir.path().join("steric.bam");
        write_fixture(&input, &[10, 38, -38, 37, -50]);

        let summary = filter_by_fragment_length(&input, &output, STERIC_HINDRANCE_CUTOFF)
            .expect("expected filter to succeed");

        assert_eq!(summary.kept, 3);
        assert_eq!(summary.dropped, 2);
        assert_eq!(
            read_back(&output),
            vec![
                ("frag1".to_string(), 38),
                ("frag2".to_string(), -38),
                ("frag4".to_string(), -50),
            ]
        );

        let reader = bam::Reader::from_path(&output).expect("expected output reader");
        assert_eq!(reader.header().target_names(), vec![b"chr1".as_slice()]);
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let result = filter_by_fragment_length(
            &dir.path().join("absent.bam"),
            &dir.path().join("out.bam"),
            STERIC_HINDRANCE_CUTOFF,
        );
        assert!(result.is_err());
    }

    #[test]
    fn allow_list_covers_autosomes_and_sex_chromosomes() {
        let allowed = allowed_chromosomes();
        assert_eq!(allowed.len(), 24);
        assert_eq!(allowed.first().map(String::as_str), Some("chr1"));
        assert_eq!(allowed.last().map(String::as_str), Some("chrY"));
    }

    #[test]
    fn allow_list_excludes_mitochondrial_and_unplaced_contigs() {
        let allowed = allowed_chromosomes();
        for name in ["chrM", "chr1_random", "chrUn_gl000220", "chr23", "chr0", "chr01"] {
            assert!(!allowed.iter().any(|chrom| chrom == name), "{name} should be excluded");
        }
        for name in ["chr1", "chr22", "chrX", "chrY"] {
            assert!(allowed.iter().any(|chrom| chrom == name), "{name} should be retained");
        }
    }
}
