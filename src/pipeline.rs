use crate::cli::PipelineArgs;
use crate::errors::{AppError, Result};
use crate::external_tools::ExternalTools;
use crate::genome::GenomeSizes;
use crate::qc::{self, Metric, QcMetrics, ReadPairCounts};
use crate::shift::{self, ShiftOffsets};
use crate::stages::{
    ReadPair, RunContext, Stage, StageTracker, StagingDelete, bai_path_for, sai_path_for,
    with_suffix,
};
use crate::steric::{self, MIN_UNIQUE_MAPQ, STERIC_HINDRANCE_CUTOFF};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

/// Reference files consumed by stage 5.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceFiles {
    pub blacklist_bed: Option<PathBuf>,
    pub genome_sizes: Option<PathBuf>,
}

impl ReferenceFiles {
    fn blacklist_bed(&self) -> Result<&Path> {
        self.blacklist_bed
            .as_deref()
            .ok_or_else(|| AppError::MissingRequired {
                field: "--blacklist-bed".to_string(),
            })
    }

    fn genome_sizes(&self) -> Result<&Path> {
        self.genome_sizes
            .as_deref()
            .ok_or_else(|| AppError::MissingRequired {
                field: "--genome-sizes".to_string(),
            })
    }
}

/// What a single stage hands back to the driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub qc: QcMetrics,
    pub staged: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub stages_run: Vec<Stage>,
    pub qc: QcMetrics,
    pub removed_files: usize,
}

/// Executes individual stages against one run's deterministic file layout.
#[derive(Debug, Clone, Copy)]
pub struct StageRunner<'a> {
    context: &'a RunContext,
    tools: &'a ExternalTools,
    references: &'a ReferenceFiles,
}

impl<'a> StageRunner<'a> {
    pub fn new(
        context: &'a RunContext,
        tools: &'a ExternalTools,
        references: &'a ReferenceFiles,
    ) -> Self {
        Self {
            context,
            tools,
            references,
        }
    }

    pub fn run_stage(&self, stage: Stage, read_pairs: &mut [ReadPair]) -> Result<StageOutput> {
        match stage {
            Stage::Trim => self.trim(read_pairs),
            Stage::AlignReads => self.align_reads(read_pairs),
            Stage::AlignPairs => self.align_pairs(read_pairs),
            Stage::PostProcess => self.post_process(read_pairs.len()),
            Stage::ShiftReads => self.shift_reads(),
            Stage::CallPeaks => self.call_peaks(),
        }
    }

    fn trim(&self, read_pairs: &mut [ReadPair]) -> Result<StageOutput> {
        let mut output = StageOutput::default();
        let summary_log = self.context.log_file("cutadapt.summary.log");

        for (index, pair) in read_pairs.iter_mut().enumerate() {
            output.qc.total_raw_reads_counts.push(count_pair(pair));

            let trimmed = self.context.paths().trimmed_pair(index);
            self.tools.cutadapt(
                pair,
                &trimmed,
                &self.context.forward_adapter,
                &self.context.reverse_adapter,
                &summary_log,
            )?;

            output.qc.trimmed_reads_counts.push(count_pair(&trimmed));
            output
                .staged
                .extend([trimmed.read1.clone(), trimmed.read2.clone()]);
            *pair = trimmed;
        }
        Ok(output)
    }

    fn align_reads(&self, read_pairs: &[ReadPair]) -> Result<StageOutput> {
        let mut output = StageOutput::default();
        let fastqc_dir = self.context.paths().fastqc_dir();
        fs::create_dir_all(&fastqc_dir)
            .map_err(|err| AppError::file("create directory", &fastqc_dir, err))?;

        for pair in read_pairs {
            for read in pair.reads() {
                self.tools.fastqc(&fastqc_dir, read)?;
                let sai = sai_path_for(read);
                self.tools.bwa_aln(read, &sai)?;
                output.staged.push(sai);
            }
        }
        Ok(output)
    }

    fn align_pairs(&self, read_pairs: &[ReadPair]) -> Result<StageOutput> {
        let sampe_log = self.context.log_file("bwa_sampe.log");
        for (index, pair) in read_pairs.iter().enumerate() {
            let bam = self.context.paths().pair_bam(index);
            self.tools.bwa_sampe_to_bam(
                pair,
                &sai_path_for(&pair.read1),
                &sai_path_for(&pair.read2),
                &bam,
                &sampe_log,
            )?;
        }
        Ok(StageOutput::default())
    }

    fn post_process(&self, pair_count: usize) -> Result<StageOutput> {
        let paths = self.context.paths();
        let mut output = StageOutput::default();

        let pair_bams = (0..pair_count)
            .map(|index| paths.pair_bam(index))
            .collect::<Vec<_>>();
        for bam in &pair_bams {
            let flagstat = with_suffix(bam, ".flagstat");
            self.tools.samtools_flagstat(bam, &flagstat)?;
            output
                .qc
                .num_reads_mapped
                .push(qc::scrape_flagstat_mapped_pairs(&flagstat));
        }

        let sortmerged = paths.sortmerged_bam();
        let steric_bam = paths.steric_bam();
        let duprm = paths.duprm_bam();
        let unique = paths.unique_bam();
        let unmappedrm = paths.unmappedrm_bam();
        let chrmrm = paths.chrmrm_bam();

        self.tools.novosort(
            &self.context.tmp_dir,
            &pair_bams,
            &sortmerged,
            &self.context.log_file("novosort.log"),
        )?;
        self.tools.samtools_index(&sortmerged)?;

        let steric_summary =
            steric::filter_by_fragment_length(&sortmerged, &steric_bam, STERIC_HINDRANCE_CUTOFF)?;
        output.qc.steric_filter = Metric::Value(steric_summary);

        let duplicate_metrics = paths.duplicate_metrics();
        self.tools.picard_mark_duplicates(
            &steric_bam,
            &duprm,
            &self.context.tmp_dir,
            &duplicate_metrics,
            &self.context.log_file("mark_dup.log"),
        )?;
        output.qc.percent_duplicate_reads = qc::scrape_duplicate_rate(&duplicate_metrics);

        let secondary = steric::SECONDARY_FLAG.to_string();
        let min_mapq = MIN_UNIQUE_MAPQ.to_string();
        self.tools.samtools_view_filter(
            &duprm,
            &unique,
            &["-F", secondary.as_str(), "-q", min_mapq.as_str()],
            &[],
        )?;

        let unmapped = steric::UNMAPPED_OR_MATE_UNMAPPED_FLAGS.to_string();
        self.tools
            .samtools_view_filter(&unique, &unmappedrm, &["-F", unmapped.as_str()], &[])?;

        self.tools.samtools_index(&unmappedrm)?;
        self.tools.samtools_view_filter(
            &unmappedrm,
            &chrmrm,
            &[],
            &steric::allowed_chromosomes(),
        )?;

        output.staged.extend([
            bai_path_for(&sortmerged),
            sortmerged,
            steric_bam,
            unique,
            duprm,
            bai_path_for(&unmappedrm),
            unmappedrm,
        ]);
        Ok(output)
    }

    fn shift_reads(&self) -> Result<StageOutput> {
        let paths = self.context.paths();
        let mut output = StageOutput::default();

        let chrmrm = paths.chrmrm_bam();
        let processed_bam = paths.processed_bam();
        let unshifted = paths.unshifted_bed();

        self.tools.bedtools_remove_blacklisted(
            &chrmrm,
            self.references.blacklist_bed()?,
            &processed_bam,
        )?;
        self.tools.picard_insert_size_metrics(
            &processed_bam,
            &paths.insert_size_metrics(),
            &paths.insert_size_histogram(),
        )?;
        self.tools.samtools_index(&processed_bam)?;
        self.tools.bedtools_bamtobed(&processed_bam, &unshifted)?;
        output.staged.push(unshifted.clone());

        let genome_sizes = GenomeSizes::from_path(self.references.genome_sizes()?)?;
        let summary = shift::shift_bed_file(
            &unshifted,
            &paths.processed_bed(),
            &genome_sizes,
            &paths.shift_log(),
            ShiftOffsets::default(),
        )?;
        output.qc.shifted_reads = Metric::Value(summary);
        Ok(output)
    }

    fn call_peaks(&self) -> Result<StageOutput> {
        let paths = self.context.paths();
        let mut output = StageOutput::default();

        let tag_dir = paths.tag_dir();
        let unsorted = paths.unsorted_peaks();
        let sorted = paths.sorted_peaks();
        let merged = paths.merged_peaks();

        self.tools.make_tag_directory(
            &tag_dir,
            &paths.processed_bed(),
            &self.context.log_file("maketagdir.log"),
        )?;
        self.tools
            .find_peaks(&tag_dir, &self.context.log_file("findpeaks.log"))?;
        self.tools.pos2bed(
            &tag_dir.join("peaks.txt"),
            &unsorted,
            &self.context.log_file("pos2bed.log"),
        )?;
        self.tools.bedtools_sort(&unsorted, &sorted)?;
        self.tools.bedtools_merge(&sorted, &merged)?;

        output.qc.num_peaks_called = qc::count_peaks(&merged);
        output.staged.extend([unsorted, sorted]);
        Ok(output)
    }
}

fn count_pair(pair: &ReadPair) -> ReadPairCounts {
    ReadPairCounts {
        read1: qc::count_gzipped_fastq_reads(&pair.read1),
        read2: qc::count_gzipped_fastq_reads(&pair.read2),
    }
}

/// Runs stages `args.start..=6`, writes the QC record, then removes staged intermediates.
pub fn run(args: &PipelineArgs) -> Result<RunReport> {
    let output_dir = std::path::absolute(&args.output)?;
    let context = args.run_context(output_dir);
    info!(
        lib = %context.lib_prefix,
        output = %context.output_dir.display(),
        start = %context.start,
        read_pairs = args.read_pairs.len(),
        "starting pipeline run"
    );

    for dir in [&context.output_dir, &context.tmp_dir, &context.logs_dir] {
        fs::create_dir_all(dir).map_err(|err| AppError::file("create directory", dir, err))?;
    }

    let mut tracker = StageTracker::new(context.start);
    let stages = tracker.pending();
    args.tools.ensure_available(&stages)?;

    let references = ReferenceFiles {
        blacklist_bed: args.blacklist_bed.clone(),
        genome_sizes: args.genome_sizes.clone(),
    };
    let runner = StageRunner::new(&context, &args.tools, &references);
    let mut read_pairs = resumed_read_pairs(&context, &args.read_pairs);
    let mut staging = StagingDelete::default();
    staging.push(context.tmp_dir.clone());
    let mut run_qc = QcMetrics::default();
    let mut progress = StageProgress::new(args.progress, stages.len());

    for stage in &stages {
        tracker.begin(*stage)?;
        progress.on_started(*stage);
        let started = Instant::now();

        let output = runner.run_stage(*stage, &mut read_pairs)?;
        run_qc.merge(output.qc);
        staging.extend(output.staged);

        tracker.finish(*stage)?;
        progress.on_finished();
        info!(
            stage = %stage,
            elapsed_ms = started.elapsed().as_millis(),
            "stage finished"
        );
    }
    progress.finish();

    let qc_path = context.paths().qc_metrics();
    run_qc.write_to(&qc_path)?;
    info!(path = %qc_path.display(), "wrote QC metrics");

    let staged = staging.len();
    let removed_files = staging.remove_all();
    info!(staged, removed = removed_files, "cleaned up intermediate files");

    Ok(RunReport {
        stages_run: stages,
        qc: run_qc,
        removed_files,
    })
}

/// A run resumed past trimming reads the trimmed files written by the earlier run.
fn resumed_read_pairs(context: &RunContext, read_pairs: &[ReadPair]) -> Vec<ReadPair> {
    if context.start <= Stage::Trim {
        return read_pairs.to_vec();
    }
    (0..read_pairs.len())
        .map(|index| context.paths().trimmed_pair(index))
        .collect()
}

#[derive(Debug)]
struct StageProgress {
    progress_bar: Option<ProgressBar>,
    finished: bool,
}

impl StageProgress {
    fn new(enabled: bool, stages: usize) -> Self {
        let progress_bar = if enabled {
            let bar = ProgressBar::new(stages as u64);
            bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(4));
            let style = ProgressStyle::with_template(
                "{spinner:.green} {elapsed_precise} [{bar:24}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar.enable_steady_tick(Duration::from_millis(200));
            Some(bar)
        } else {
            None
        };

        Self {
            progress_bar,
            finished: false,
        }
    }

    fn on_started(&self, stage: Stage) {
        if let Some(bar) = &self.progress_bar {
            bar.set_message(format!("stage {stage}"));
        }
    }

    fn on_finished(&self) {
        if let Some(bar) = &self.progress_bar {
            bar.inc(1);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = &self.progress_bar {
            bar.finish_with_message("done");
        }
        self.finished = true;
    }
}

impl Drop for StageProgress {
    fn drop(&mut self) {
        if !self.finished
            && let Some(bar) = &self.progress_bar
        {
            bar.finish_and_clear();
        }
    }
}
