use crate::errors::{AppError, Result};
use crate::stages::{ReadPair, Stage};
use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::info;

/// An executable plus any leading arguments, e.g. `java -jar /opt/picard.jar`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub prefix_args: Vec<String>,
}

impl ToolCommand {
    pub fn parse(flag: &str, value: &str) -> Result<Self> {
        let mut parts = value.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| AppError::InvalidValue {
            flag: flag.to_string(),
            value: value.to_string(),
            reason: "tool command must not be empty".to_string(),
        })?;
        Ok(Self {
            program,
            prefix_args: parts.collect(),
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.prefix_args);
        command
    }

    fn label<I, S>(&self, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut label = self.program.clone();
        for arg in self.prefix_args.iter().map(OsStr::new) {
            label.push(' ');
            label.push_str(&arg.to_string_lossy());
        }
        for arg in args {
            label.push(' ');
            label.push_str(&arg.as_ref().to_string_lossy());
        }
        label
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
    Both,
}

#[derive(Debug, Clone)]
struct Redirect {
    stream: Stream,
    path: PathBuf,
    append: bool,
}

impl Redirect {
    fn stdout(path: &Path) -> Self {
        Self {
            stream: Stream::Stdout,
            path: path.to_path_buf(),
            append: false,
        }
    }

    fn stderr(path: &Path) -> Self {
        Self {
            stream: Stream::Stderr,
            path: path.to_path_buf(),
            append: false,
        }
    }

    fn both(path: &Path) -> Self {
        Self {
            stream: Stream::Both,
            path: path.to_path_buf(),
            append: false,
        }
    }

    fn appending(mut self) -> Self {
        self.append = true;
        self
    }

    fn open(&self) -> Result<File> {
        let opened = if self.append {
            OpenOptions::new().create(true).append(true).open(&self.path)
        } else {
            File::create(&self.path)
        };
        opened.map_err(|err| AppError::file("open redirect target", &self.path, err))
    }
}

/// Settings for every external collaborator the stages invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTools {
    pub cutadapt: ToolCommand,
    pub fastqc: ToolCommand,
    pub bwa: ToolCommand,
    pub bwa_threads: usize,
    pub bwa_index: Option<PathBuf>,
    pub samtools: ToolCommand,
    pub novosort: ToolCommand,
    pub novosort_threads: usize,
    pub picard: ToolCommand,
    pub bedtools: ToolCommand,
    pub make_tag_directory: ToolCommand,
    pub find_peaks: ToolCommand,
    pub pos2bed: ToolCommand,
}

impl ExternalTools {
    fn required_for(&self, stage: Stage) -> Vec<&ToolCommand> {
        match stage {
            Stage::Trim => vec![&self.cutadapt],
            Stage::AlignReads => vec![&self.fastqc, &self.bwa],
            Stage::AlignPairs => vec![&self.bwa, &self.samtools],
            Stage::PostProcess => vec![&self.samtools, &self.novosort, &self.picard],
            Stage::ShiftReads => vec![&self.bedtools, &self.picard, &self.samtools],
            Stage::CallPeaks => vec![
                &self.make_tag_directory,
                &self.find_peaks,
                &self.pos2bed,
                &self.bedtools,
            ],
        }
    }

    /// Fails with the first tool needed by `stages` that cannot be found.
    pub fn ensure_available(&self, stages: &[Stage]) -> Result<()> {
        for stage in stages {
            for tool in self.required_for(*stage) {
                if !self.exists_command(&tool.program) {
                    return Err(AppError::CommandNotFound {
                        command: tool.program.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn exists_command(&self, cmd: &str) -> bool {
        if Path::new(cmd).is_file() {
            return true;
        }
        std::env::var_os("PATH").is_some_and(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(cmd))
                .any(|full| full.is_file())
        })
    }

    fn bwa_index(&self) -> Result<&Path> {
        self.bwa_index
            .as_deref()
            .ok_or_else(|| AppError::MissingRequired {
                field: "--bwa-index".to_string(),
            })
    }

    pub fn cutadapt(
        &self,
        raw: &ReadPair,
        trimmed: &ReadPair,
        forward_adapter: &str,
        reverse_adapter: &str,
        summary_log: &Path,
    ) -> Result<()> {
        let args: Vec<OsString> = vec![
            "--quality-base=33".into(),
            "--minimum-length=5".into(),
            "-q".into(),
            "30".into(),
            prefixed("--output=", &trimmed.read1),
            prefixed("--paired-output=", &trimmed.read2),
            "-a".into(),
            forward_adapter.into(),
            "-A".into(),
            reverse_adapter.into(),
            raw.read1.clone().into(),
            raw.read2.clone().into(),
        ];
        self.run(
            &self.cutadapt,
            args,
            &[Redirect::stdout(summary_log).appending()],
        )
    }

    pub fn fastqc(&self, output_dir: &Path, read: &Path) -> Result<()> {
        let args = vec![prefixed("--outdir=", output_dir), read.into()];
        self.run(&self.fastqc, args, &[])
    }

    /// Single-end `bwa aln` pass writing the suffix-array index for one read file.
    pub fn bwa_aln(&self, read: &Path, sai_output: &Path) -> Result<()> {
        let args: Vec<OsString> = vec![
            "aln".into(),
            "-t".into(),
            self.bwa_threads.to_string().into(),
            self.bwa_index()?.into(),
            read.into(),
        ];
        self.run(&self.bwa, args, &[Redirect::stdout(sai_output)])
    }

    /// `bwa sampe ... | samtools view -hSb -o <bam> -`
    pub fn bwa_sampe_to_bam(
        &self,
        pair: &ReadPair,
        sai1: &Path,
        sai2: &Path,
        bam_output: &Path,
        sampe_log: &Path,
    ) -> Result<()> {
        let sampe_args: Vec<OsString> = vec![
            "sampe".into(),
            "-a".into(),
            "2000".into(),
            "-n".into(),
            "1".into(),
            self.bwa_index()?.into(),
            sai1.into(),
            sai2.into(),
            pair.read1.clone().into(),
            pair.read2.clone().into(),
        ];
        let view_args: Vec<OsString> = vec![
            "view".into(),
            "-hSb".into(),
            "-o".into(),
            bam_output.into(),
            "-".into(),
        ];
        let label = format!(
            "{} | {}",
            self.bwa.label(&sampe_args),
            self.samtools.label(&view_args)
        );
        info!(command = %label, "running piped external tools");

        let mut sampe = self.bwa.command();
        sampe
            .args(&sampe_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::from(
                Redirect::stderr(sampe_log).appending().open()?,
            ));
        let mut sampe_child = sampe
            .spawn()
            .map_err(|err| map_command_spawn_error(err, &self.bwa.program))?;
        let sampe_stdout = sampe_child
            .stdout
            .take()
            .ok_or_else(|| AppError::ParseError {
                message: "failed to capture bwa sampe stdout for piping".to_string(),
            })?;

        let mut view = self.samtools.command();
        view.args(&view_args)
            .stdin(Stdio::from(sampe_stdout))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let view_output = match view.output() {
            Ok(output) => output,
            Err(err) => {
                let _ = sampe_child.kill();
                let _ = sampe_child.wait();
                return Err(map_command_spawn_error(err, &self.samtools.program));
            }
        };
        let sampe_status = sampe_child.wait()?;

        if sampe_status.success() && view_output.status.success() {
            return Ok(());
        }
        Err(AppError::CommandFailed {
            command: label,
            code: view_output.status.code().or(sampe_status.code()),
            stderr: format!(
                "bwa sampe stderr in {}\nsamtools view stderr:\n{}",
                sampe_log.display(),
                String::from_utf8_lossy(&view_output.stderr).trim()
            ),
        })
    }

    pub fn samtools_flagstat(&self, bam: &Path, report: &Path) -> Result<()> {
        let args: Vec<OsString> = vec!["flagstat".into(), bam.into()];
        self.run(&self.samtools, args, &[Redirect::stdout(report)])
    }

    pub fn samtools_index(&self, bam: &Path) -> Result<()> {
        let args: Vec<OsString> = vec!["index".into(), bam.into()];
        self.run(&self.samtools, args, &[])
    }

    /// `samtools view -b [filters] -o <output> <input> [regions]`
    pub fn samtools_view_filter(
        &self,
        input: &Path,
        output: &Path,
        filters: &[&str],
        regions: &[String],
    ) -> Result<()> {
        let mut args: Vec<OsString> = vec!["view".into(), "-b".into()];
        args.extend(filters.iter().map(OsString::from));
        args.push("-o".into());
        args.push(output.into());
        args.push(input.into());
        args.extend(regions.iter().map(OsString::from));
        self.run(&self.samtools, args, &[])
    }

    /// Merge-sorts the per-pair containers into one coordinate-sorted container on stdout.
    pub fn novosort(
        &self,
        tmp_dir: &Path,
        inputs: &[PathBuf],
        output: &Path,
        log: &Path,
    ) -> Result<()> {
        let mut args: Vec<OsString> = vec![
            "--threads".into(),
            self.novosort_threads.to_string().into(),
            "--tmpcompression".into(),
            "6".into(),
            "--tmpdir".into(),
            tmp_dir.into(),
        ];
        args.extend(inputs.iter().map(OsString::from));
        self.run(
            &self.novosort,
            args,
            &[Redirect::stdout(output), Redirect::stderr(log)],
        )
    }

    pub fn picard_mark_duplicates(
        &self,
        input: &Path,
        output: &Path,
        tmp_dir: &Path,
        metrics: &Path,
        log: &Path,
    ) -> Result<()> {
        let args = vec![
            "MarkDuplicates".into(),
            prefixed("INPUT=", input),
            prefixed("OUTPUT=", output),
            prefixed("TMP_DIR=", tmp_dir),
            prefixed("METRICS_FILE=", metrics),
            "REMOVE_DUPLICATES=true".into(),
            "VALIDATION_STRINGENCY=LENIENT".into(),
        ];
        self.run(&self.picard, args, &[Redirect::both(log)])
    }

    pub fn picard_insert_size_metrics(
        &self,
        input: &Path,
        metrics: &Path,
        histogram: &Path,
    ) -> Result<()> {
        let args = vec![
            "CollectInsertSizeMetrics".into(),
            prefixed("INPUT=", input),
            prefixed("OUTPUT=", metrics),
            prefixed("HISTOGRAM_FILE=", histogram),
        ];
        self.run(&self.picard, args, &[])
    }

    /// Drops alignments overlapping the blacklist by at least half their length.
    pub fn bedtools_remove_blacklisted(
        &self,
        bam: &Path,
        blacklist: &Path,
        output: &Path,
    ) -> Result<()> {
        let args: Vec<OsString> = vec![
            "intersect".into(),
            "-v".into(),
            "-abam".into(),
            bam.into(),
            "-b".into(),
            blacklist.into(),
            "-f".into(),
            "0.5".into(),
        ];
        self.run(&self.bedtools, args, &[Redirect::stdout(output)])
    }

    pub fn bedtools_bamtobed(&self, bam: &Path, output: &Path) -> Result<()> {
        let args: Vec<OsString> = vec!["bamtobed".into(), "-i".into(), bam.into()];
        self.run(&self.bedtools, args, &[Redirect::stdout(output)])
    }

    pub fn bedtools_sort(&self, input: &Path, output: &Path) -> Result<()> {
        let args: Vec<OsString> = vec!["sort".into(), "-i".into(), input.into()];
        self.run(&self.bedtools, args, &[Redirect::stdout(output)])
    }

    pub fn bedtools_merge(&self, input: &Path, output: &Path) -> Result<()> {
        let args: Vec<OsString> = vec!["merge".into(), "-i".into(), input.into()];
        self.run(&self.bedtools, args, &[Redirect::stdout(output)])
    }

    pub fn make_tag_directory(&self, tag_dir: &Path, bed: &Path, log: &Path) -> Result<()> {
        let args: Vec<OsString> = vec![
            tag_dir.into(),
            "-format".into(),
            "bed".into(),
            bed.into(),
        ];
        self.run(&self.make_tag_directory, args, &[Redirect::both(log)])
    }

    /// DNase-style peak calling; results land in `<tag_dir>/peaks.txt`.
    pub fn find_peaks(&self, tag_dir: &Path, log: &Path) -> Result<()> {
        let mut args: Vec<OsString> = vec![tag_dir.into()];
        args.extend(
            [
                "-fragLength",
                "0",
                "-fdr",
                "0.01",
                "-localSize",
                "50000",
                "-o",
                "auto",
                "-style",
                "dnase",
                "-size",
                "150",
                "-minDist",
                "50",
            ]
            .into_iter()
            .map(OsString::from),
        );
        self.run(&self.find_peaks, args, &[Redirect::both(log)])
    }

    pub fn pos2bed(&self, peaks: &Path, output: &Path, log: &Path) -> Result<()> {
        let args: Vec<OsString> = vec![peaks.into()];
        self.run(
            &self.pos2bed,
            args,
            &[Redirect::stdout(output), Redirect::stderr(log)],
        )
    }

    /// Runs a tool to completion. Unrouted stdout is discarded and unrouted stderr is
    /// captured for the error message.
    fn run(&self, tool: &ToolCommand, args: Vec<OsString>, redirects: &[Redirect]) -> Result<()> {
        let label = tool.label(&args);
        info!(command = %label, "running external tool");

        let mut command = tool.command();
        command.args(&args).stdout(Stdio::null()).stderr(Stdio::piped());

        let mut stderr_log = None;
        for redirect in redirects {
            let file = redirect.open()?;
            match redirect.stream {
                Stream::Stdout => {
                    command.stdout(Stdio::from(file));
                }
                Stream::Stderr => {
                    command.stderr(Stdio::from(file));
                    stderr_log = Some(redirect.path.clone());
                }
                Stream::Both => {
                    command.stdout(Stdio::from(file.try_clone()?));
                    command.stderr(Stdio::from(file));
                    stderr_log = Some(redirect.path.clone());
                }
            }
        }

        let output = command
            .output()
            .map_err(|err| map_command_spawn_error(err, &tool.program))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = match stderr_log {
            Some(path) => format!("see {}", path.display()),
            None => String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };
        Err(AppError::CommandFailed {
            command: label,
            code: output.status.code(),
            stderr,
        })
    }
}

fn prefixed(prefix: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(prefix);
    arg.push(path.as_os_str());
    arg
}

fn map_command_spawn_error(error: std::io::Error, command_name: &str) -> AppError {
    if error.kind() == std::io::ErrorKind::NotFound {
        return AppError::CommandNotFound {
            command: command_name.to_string(),
        };
    }
    AppError::Io(error)
}
