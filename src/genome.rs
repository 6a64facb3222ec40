use crate::errors::{AppError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Chromosome lengths keyed by name, used as the boundary oracle when shifting intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenomeSizes {
    lengths: HashMap<String, u64>,
}

impl GenomeSizes {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| AppError::file("open genome sizes", path, err))?;
        Self::from_reader(BufReader::new(file)).map_err(|err| match err {
            AppError::ParseError { message } => AppError::ParseError {
                message: format!("{} ({})", message, path.display()),
            },
            other => other,
        })
    }

    /// Parses `chromosome<TAB>length` lines. Blank lines are ignored.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut lengths = HashMap::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let (chrom, raw_length) =
                trimmed
                    .split_once('\t')
                    .ok_or_else(|| AppError::ParseError {
                        message: format!(
                            "genome sizes line {} is not tab-separated: {trimmed}",
                            index + 1
                        ),
                    })?;
            let length = raw_length
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|value| *value > 0)
                .ok_or_else(|| AppError::ParseError {
                    message: format!(
                        "genome sizes line {} has invalid length for {chrom}: {raw_length}",
                        index + 1
                    ),
                })?;
            lengths.insert(chrom.to_string(), length);
        }
        Ok(Self { lengths })
    }

    pub fn length(&self, chrom: &str) -> Option<u64> {
        self.lengths.get(chrom).copied()
    }

    /// True when `position` lies in `1..=length(chrom)`. Unknown chromosomes are never in bounds.
    pub fn within_bounds(&self, chrom: &str, position: i64) -> bool {
        if position < 1 {
            return false;
        }
        self.length(chrom)
            .is_some_and(|length| u64::try_from(position).is_ok_and(|pos| pos <= length))
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }
}

impl FromIterator<(String, u64)> for GenomeSizes {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self {
            lengths: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::GenomeSizes;
    use std::io::Cursor;

    #[test]
    fn parses_tab_separated_lengths() {
        let sizes = GenomeSizes::from_reader(Cursor::new("chr1\t248956422\nchrM\t16569\n\n"))
            .expect("expected genome sizes to parse");

        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes.length("chr1"), Some(248_956_422));
        assert_eq!(sizes.length("chrM"), Some(16_569));
        assert_eq!(sizes.length("chr2"), None);
    }

    #[test]
    fn rejects_line_without_tab() {
        let result = GenomeSizes::from_reader(Cursor::new("chr1 100\n"));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_zero_length() {
        let result = GenomeSizes::from_reader(Cursor::new("chr1\t0\n"));
        assert!(result.is_err());
    }

    #[test]
    fn bounds_are_one_based_and_inclusive() {
        let sizes: GenomeSizes = [("chr1".to_string(), 100)].into_iter().collect();

        assert!(!sizes.within_bounds("chr1", 0));
        assert!(sizes.within_bounds("chr1", 1));
        assert!(sizes.within_bounds("chr1", 100));
        assert!(!sizes.within_bounds("chr1", 101));
        assert!(!sizes.within_bounds("chr1", -4));
        assert!(!sizes.within_bounds("chrUn", 50));
    }
}
