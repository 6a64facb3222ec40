use crate::errors::{AppError, Result};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const NO_ADAPTER_SENTINEL: &str = "ZZZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Trim,
    AlignReads,
    AlignPairs,
    PostProcess,
    ShiftReads,
    CallPeaks,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Trim,
        Stage::AlignReads,
        Stage::AlignPairs,
        Stage::PostProcess,
        Stage::ShiftReads,
        Stage::CallPeaks,
    ];

    pub fn number(self) -> u8 {
        match self {
            Self::Trim => 1,
            Self::AlignReads => 2,
            Self::AlignPairs => 3,
            Self::PostProcess => 4,
            Self::ShiftReads => 5,
            Self::CallPeaks => 6,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.number() == number)
    }

    pub fn previous(self) -> Option<Self> {
        self.number().checked_sub(1).and_then(Self::from_number)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Trim => "trim",
            Self::AlignReads => "align-reads",
            Self::AlignPairs => "align-pairs",
            Self::PostProcess => "post-process",
            Self::ShiftReads => "shift-reads",
            Self::CallPeaks => "call-peaks",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Skipped,
    Pending,
    Running,
    Done,
}

/// Tracks stage progress so a stage only starts once its predecessor is done or resumed past.
#[derive(Debug, Clone)]
pub struct StageTracker {
    states: [StageState; 6],
}

impl StageTracker {
    pub fn new(start: Stage) -> Self {
        let mut states = [StageState::Pending; 6];
        for stage in Stage::ALL {
            if stage < start {
                states[Self::slot(stage)] = StageState::Skipped;
            }
        }
        Self { states }
    }

    pub fn state(&self, stage: Stage) -> StageState {
        self.states[Self::slot(stage)]
    }

    /// Stages still to run, in order.
    pub fn pending(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.state(*stage) == StageState::Pending)
            .collect()
    }

    pub fn begin(&mut self, stage: Stage) -> Result<()> {
        if self.state(stage) != StageState::Pending {
            return Err(AppError::StageOrder {
                stage: stage.to_string(),
                reason: format!("expected pending, found {:?}", self.state(stage)),
            });
        }
        if let Some(previous) = stage.previous() {
            let previous_state = self.state(previous);
            if !matches!(previous_state, StageState::Done | StageState::Skipped) {
                return Err(AppError::StageOrder {
                    stage: stage.to_string(),
                    reason: format!("stage {previous} is {previous_state:?}"),
                });
            }
        }
        self.states[Self::slot(stage)] = StageState::Running;
        Ok(())
    }

    pub fn finish(&mut self, stage: Stage) -> Result<()> {
        if self.state(stage) != StageState::Running {
            return Err(AppError::StageOrder {
                stage: stage.to_string(),
                reason: format!("cannot finish from {:?}", self.state(stage)),
            });
        }
        self.states[Self::slot(stage)] = StageState::Done;
        Ok(())
    }

    fn slot(stage: Stage) -> usize {
        usize::from(stage.number() - 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPair {
    pub read1: PathBuf,
    pub read2: PathBuf,
}

impl ReadPair {
    pub fn new(read1: impl Into<PathBuf>, read2: impl Into<PathBuf>) -> Self {
        Self {
            read1: read1.into(),
            read2: read2.into(),
        }
    }

    /// Parses `read1:read2`.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |reason: &str| AppError::InvalidValue {
            flag: "--reads".to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let (read1, read2) = value
            .split_once(':')
            .ok_or_else(|| invalid("expected read1:read2"))?;
        if read1.is_empty() || read2.is_empty() || read2.contains(':') {
            return Err(invalid("expected exactly two non-empty paths"));
        }
        Ok(Self::new(read1, read2))
    }

    pub fn reads(&self) -> [&Path; 2] {
        [&self.read1, &self.read2]
    }
}

/// Immutable settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub lib_prefix: String,
    pub output_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub start: Stage,
    pub forward_adapter: String,
    pub reverse_adapter: String,
}

impl RunContext {
    pub fn new(
        lib_prefix: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        start: Stage,
        forward_adapter: &str,
        reverse_adapter: &str,
    ) -> Self {
        let output_dir = output_dir.into();
        Self {
            lib_prefix: lib_prefix.into(),
            logs_dir: output_dir.join("logs"),
            tmp_dir: output_dir.join("tmp"),
            output_dir,
            start,
            forward_adapter: adapter_or_sentinel(forward_adapter),
            reverse_adapter: adapter_or_sentinel(reverse_adapter),
        }
    }

    pub fn paths(&self) -> RunPaths<'_> {
        RunPaths { context: self }
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.logs_dir.join(name)
    }
}

/// Trimmer adapters fall back to a pattern that never matches so the trimmer still runs.
pub fn adapter_or_sentinel(adapter: &str) -> String {
    let trimmed = adapter.trim();
    if trimmed.is_empty() {
        NO_ADAPTER_SENTINEL.to_string()
    } else {
        trimmed.to_string()
    }
}

/// File names derived from the run identifier, stage and pair index.
#[derive(Debug, Clone, Copy)]
pub struct RunPaths<'a> {
    context: &'a RunContext,
}

impl RunPaths<'_> {
    fn output(&self, name: String) -> PathBuf {
        self.context.output_dir.join(name)
    }

    fn lib(&self) -> &str {
        &self.context.lib_prefix
    }

    pub fn trimmed_pair(&self, index: usize) -> ReadPair {
        ReadPair::new(
            self.output(format!("{}_{index}_read1.trimmed.fastq.gz", self.lib())),
            self.output(format!("{}_{index}_read2.trimmed.fastq.gz", self.lib())),
        )
    }

    pub fn fastqc_dir(&self) -> PathBuf {
        self.context.output_dir.join("fastqc")
    }

    pub fn pair_bam(&self, index: usize) -> PathBuf {
        self.output(format!("{}.{index}.bam", self.lib()))
    }

    pub fn sortmerged_bam(&self) -> PathBuf {
        self.output(format!("{}.sortmerged.bam", self.lib()))
    }

    pub fn steric_bam(&self) -> PathBuf {
        self.output(format!("{}.steric.bam", self.lib()))
    }

    pub fn duprm_bam(&self) -> PathBuf {
        self.output(format!("{}.duprm.bam", self.lib()))
    }

    pub fn unique_bam(&self) -> PathBuf {
        self.output(format!("{}.unique.bam", self.lib()))
    }

    pub fn unmappedrm_bam(&self) -> PathBuf {
        self.output(format!("{}.unmappedrm.bam", self.lib()))
    }

    pub fn chrmrm_bam(&self) -> PathBuf {
        self.output(format!("{}.chrmrm.bam", self.lib()))
    }

    pub fn processed_bam(&self) -> PathBuf {
        self.output(format!("{}.processed.bam", self.lib()))
    }

    pub fn unshifted_bed(&self) -> PathBuf {
        self.output(format!("{}.unshifted.bed", self.lib()))
    }

    pub fn processed_bed(&self) -> PathBuf {
        self.output(format!("{}.processed.bed", self.lib()))
    }

    pub fn tag_dir(&self) -> PathBuf {
        self.output(format!("{}_tagdir", self.lib()))
    }

    pub fn unsorted_peaks(&self) -> PathBuf {
        self.output(format!("{}.unsorted.peaks.bed", self.lib()))
    }

    pub fn sorted_peaks(&self) -> PathBuf {
        self.output(format!("{}.sorted.peaks.bed", self.lib()))
    }

    pub fn merged_peaks(&self) -> PathBuf {
        self.output(format!("{}.peaks.bed", self.lib()))
    }

    pub fn insert_size_metrics(&self) -> PathBuf {
        self.context
            .log_file(&format!("{}.insertsize.metrics", self.lib()))
    }

    pub fn insert_size_histogram(&self) -> PathBuf {
        self.context
            .log_file(&format!("{}.insertsize.pdf", self.lib()))
    }

    pub fn duplicate_metrics(&self) -> PathBuf {
        self.context.log_file("mark_dup.metrics")
    }

    pub fn shift_log(&self) -> PathBuf {
        self.context.log_file("shift_reads.logs")
    }

    pub fn qc_metrics(&self) -> PathBuf {
        self.context.log_file("qc_metrics.txt")
    }
}

pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

pub fn bai_path_for(bam_path: &Path) -> PathBuf {
    with_suffix(bam_path, ".bai")
}

pub fn sai_path_for(read_path: &Path) -> PathBuf {
    with_suffix(read_path, ".sai")
}

/// Intermediate files collected during the run and removed once at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingDelete {
    paths: Vec<PathBuf>,
}

impl StagingDelete {
    pub fn push(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    pub fn extend<I, P>(&mut self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.paths.extend(paths.into_iter().map(Into::into));
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Removes every staged path, ignoring paths that are already gone. Returns how many were removed.
    pub fn remove_all(self) -> usize {
        let mut removed = 0;
        for path in self.paths {
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    debug!(path = %path.display(), "removed staged file");
                    removed += 1;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove staged file");
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ReadPair, RunContext, Stage, StageState, StageTracker, StagingDelete, adapter_or_sentinel,
        sai_path_for,
    };
    use std::fs;
    use std::path::{Path, PathBuf};

    #[test]
    fn stage_numbers_round_trip_and_order() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_number(stage.number()), Some(stage));
        }
        assert_eq!(Stage::from_number(0), None);
        assert_eq!(Stage::from_number(7), None);
        assert_eq!(Stage::Trim.previous(), None);
        assert_eq!(Stage::CallPeaks.previous(), Some(Stage::ShiftReads));
        assert!(Stage::PostProcess < Stage::ShiftReads);
    }

    #[test]
    fn resume_skips_earlier_stages() {
        let tracker = StageTracker::new(Stage::ShiftReads);
        assert_eq!(tracker.pending(), vec![Stage::ShiftReads, Stage::CallPeaks]);
        assert_eq!(tracker.state(Stage::PostProcess), StageState::Skipped);
    }

    #[test]
    fn stage_cannot_start_before_predecessor_finishes() {
        let mut tracker = StageTracker::new(Stage::Trim);
        assert!(tracker.begin(Stage::AlignReads).is_err());

        tracker.begin(Stage::Trim).expect("expected trim to start");
        assert!(tracker.begin(Stage::AlignReads).is_err());
        tracker.finish(Stage::Trim).expect("expected trim to finish");
        tracker
            .begin(Stage::AlignReads)
            .expect("expected align to start after trim");
        assert_eq!(tracker.state(Stage::AlignReads), StageState::Running);
    }

    #[test]
    fn stage_cannot_run_twice_or_finish_unstarted() {
        let mut tracker = StageTracker::new(Stage::CallPeaks);
        assert!(tracker.finish(Stage::CallPeaks).is_err());
        tracker.begin(Stage::CallPeaks).expect("expected first start");
        tracker.finish(Stage::CallPeaks).expect("expected finish");
        assert!(tracker.begin(Stage::CallPeaks).is_err());
        assert!(tracker.begin(Stage::Trim).is_err());
    }

    #[test]
    fn parses_read_pairs() {
        let pair = ReadPair::parse("a_R1.fastq.gz:a_R2.fastq.gz").expect("expected pair");
        assert_eq!(pair.read1, PathBuf::from("a_R1.fastq.gz"));
        assert_eq!(pair.read2, PathBuf::from("a_R2.fastq.gz"));

        assert!(ReadPair::parse("only_one.fastq.gz").is_err());
        assert!(ReadPair::parse(":b.fastq.gz").is_err());
        assert!(ReadPair::parse("a:b:c").is_err());
    }

    #[test]
    fn empty_adapters_fall_back_to_sentinel() {
        assert_eq!(adapter_or_sentinel(""), "ZZZ");
        assert_eq!(adapter_or_sentinel("  "), "ZZZ");
        assert_eq!(adapter_or_sentinel("CTGTCTCTTATA"), "CTGTCTCTTATA");
    }

    #[test]
    fn paths_are_keyed_by_library_and_pair_index() {
        let context = RunContext::new("lib7", "/data/out", Stage::Trim, "", "");
        let paths = context.paths();

        assert_eq!(
            paths.trimmed_pair(1).read2,
            PathBuf::from("/data/out/lib7_1_read2.trimmed.fastq.gz")
        );
        assert_eq!(paths.pair_bam(0), PathBuf::from("/data/out/lib7.0.bam"));
        assert_eq!(paths.chrmrm_bam(), PathBuf::from("/data/out/lib7.chrmrm.bam"));
        assert_eq!(paths.merged_peaks(), PathBuf::from("/data/out/lib7.peaks.bed"));
        assert_eq!(
            paths.qc_metrics(),
            PathBuf::from("/data/out/logs/qc_metrics.txt")
        );
        assert_eq!(context.tmp_dir, PathBuf::from("/data/out/tmp"));
        assert_eq!(
            sai_path_for(Path::new("/r/x.fastq.gz")),
            PathBuf::from("/r/x.fastq.gz.sai")
        );
    }

    #[test]
    fn cleanup_tolerates_missing_paths_and_removes_directories() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let tmp = dir.path().join("tmp");
        fs::create_dir_all(tmp.join("nested")).expect("expected tmp dir");
        fs::write(tmp.join("nested").join("chunk"), b"x").expect("expected chunk write");
        let file = dir.path().join("lib.steric.bam");
        fs::write(&file, b"bam").expect("expected file write");

        let mut staged = StagingDelete::default();
        staged.push(&tmp);
        staged.push(dir.path().join("never_created.bam"));
        staged.push(&file);
        staged.push(&file);

        assert_eq!(staged.remove_all(), 2);
        assert!(!tmp.exists());
        assert!(!file.exists());
    }
}
