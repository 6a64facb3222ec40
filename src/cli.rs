use crate::errors::{AppError, Result};
use crate::external_tools::{ExternalTools, ToolCommand};
use crate::stages::{NO_ADAPTER_SENTINEL, ReadPair, RunContext, Stage};
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "atacseq",
    about = "Run the staged ATAC-seq pipeline over paired-end FASTQ files"
)]
struct CliArgs {
    #[arg(long = "reads", action = ArgAction::Append, required = true)]
    reads: Vec<String>,
    #[arg(long = "output", required = true)]
    output: PathBuf,
    #[arg(long = "lib")]
    lib: Option<String>,
    #[arg(long = "step", default_value = "1")]
    step: String,
    #[arg(long = "forward-adapter", default_value = NO_ADAPTER_SENTINEL)]
    forward_adapter: String,
    #[arg(long = "reverse-adapter", default_value = NO_ADAPTER_SENTINEL)]
    reverse_adapter: String,
    #[arg(long = "cutadapt", default_value = "cutadapt")]
    cutadapt: String,
    #[arg(long = "fastqc", default_value = "fastqc")]
    fastqc: String,
    #[arg(long = "bwa", default_value = "bwa")]
    bwa: String,
    #[arg(long = "bwa-threads", default_value = "1")]
    bwa_threads: String,
    #[arg(long = "bwa-index")]
    bwa_index: Option<PathBuf>,
    #[arg(long = "samtools", default_value = "samtools")]
    samtools: String,
    #[arg(long = "novosort", default_value = "novosort")]
    novosort: String,
    #[arg(long = "novosort-threads", default_value = "1")]
    novosort_threads: String,
    #[arg(long = "picard", default_value = "picard")]
    picard: String,
    #[arg(long = "bedtools", default_value = "bedtools")]
    bedtools: String,
    #[arg(long = "make-tag-directory", default_value = "makeTagDirectory")]
    make_tag_directory: String,
    #[arg(long = "find-peaks", default_value = "findPeaks")]
    find_peaks: String,
    #[arg(long = "pos2bed", default_value = "pos2bed.pl")]
    pos2bed: String,
    #[arg(long = "blacklist-bed")]
    blacklist_bed: Option<PathBuf>,
    #[arg(long = "genome-sizes")]
    genome_sizes: Option<PathBuf>,
    #[arg(long = "progress", action = ArgAction::SetTrue)]
    progress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineArgs {
    pub read_pairs: Vec<ReadPair>,
    pub output: PathBuf,
    pub lib: String,
    pub start: Stage,
    pub forward_adapter: String,
    pub reverse_adapter: String,
    pub tools: ExternalTools,
    pub blacklist_bed: Option<PathBuf>,
    pub genome_sizes: Option<PathBuf>,
    pub progress: bool,
}

impl PipelineArgs {
    pub fn run_context(&self, output_dir: PathBuf) -> RunContext {
        RunContext::new(
            self.lib.clone(),
            output_dir,
            self.start,
            &self.forward_adapter,
            &self.reverse_adapter,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_pairs.is_empty() {
            return Err(AppError::MissingRequired {
                field: "--reads".to_string(),
            });
        }
        if self.lib.is_empty() || self.lib.contains('/') {
            return Err(AppError::InvalidValue {
                flag: "--lib".to_string(),
                value: self.lib.clone(),
                reason: "must be a non-empty name without path separators".to_string(),
            });
        }
        if self.start <= Stage::AlignPairs && self.tools.bwa_index.is_none() {
            return Err(AppError::MissingRequired {
                field: "--bwa-index (required when starting at step 3 or earlier)".to_string(),
            });
        }
        if self.start <= Stage::ShiftReads {
            if self.blacklist_bed.is_none() {
                return Err(AppError::MissingRequired {
                    field: "--blacklist-bed (required when starting at step 5 or earlier)"
                        .to_string(),
                });
            }
            if self.genome_sizes.is_none() {
                return Err(AppError::MissingRequired {
                    field: "--genome-sizes (required when starting at step 5 or earlier)"
                        .to_string(),
                });
            }
        }
        Ok(())
    }
}

pub fn parse_from_env() -> Result<PipelineArgs> {
    parse_args(std::env::args())
}

pub fn parse_args<I, S>(args: I) -> Result<PipelineArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut tokens: Vec<String> = args.into_iter().map(Into::into).collect();
    if tokens.is_empty() {
        tokens.push("atacseq".to_string());
    }

    let cli = CliArgs::try_parse_from(tokens).map_err(map_clap_error)?;

    let read_pairs = cli
        .reads
        .iter()
        .map(|value| ReadPair::parse(value))
        .collect::<Result<Vec<_>>>()?;

    let tools = ExternalTools {
        cutadapt: ToolCommand::parse("--cutadapt", &cli.cutadapt)?,
        fastqc: ToolCommand::parse("--fastqc", &cli.fastqc)?,
        bwa: ToolCommand::parse("--bwa", &cli.bwa)?,
        bwa_threads: parse_threads("--bwa-threads", &cli.bwa_threads)?,
        bwa_index: cli.bwa_index,
        samtools: ToolCommand::parse("--samtools", &cli.samtools)?,
        novosort: ToolCommand::parse("--novosort", &cli.novosort)?,
        novosort_threads: parse_threads("--novosort-threads", &cli.novosort_threads)?,
        picard: ToolCommand::parse("--picard", &cli.picard)?,
        bedtools: ToolCommand::parse("--bedtools", &cli.bedtools)?,
        make_tag_directory: ToolCommand::parse("--make-tag-directory", &cli.make_tag_directory)?,
        find_peaks: ToolCommand::parse("--find-peaks", &cli.find_peaks)?,
        pos2bed: ToolCommand::parse("--pos2bed", &cli.pos2bed)?,
    };

    let parsed = PipelineArgs {
        read_pairs,
        output: cli.output,
        lib: cli.lib.unwrap_or_else(default_lib_prefix),
        start: parse_step(&cli.step)?,
        forward_adapter: cli.forward_adapter,
        reverse_adapter: cli.reverse_adapter,
        tools,
        blacklist_bed: cli.blacklist_bed,
        genome_sizes: cli.genome_sizes,
        progress: cli.progress,
    };

    parsed.validate()?;
    Ok(parsed)
}

fn default_lib_prefix() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

/// Step `0` predates 1-based numbering and means "from the beginning".
fn parse_step(value: &str) -> Result<Stage> {
    let invalid = || AppError::InvalidValue {
        flag: "--step".to_string(),
        value: value.to_string(),
        reason: "must be an integer between 1 and 6".to_string(),
    };
    let number = value.trim().parse::<u8>().map_err(|_| invalid())?;
    Stage::from_number(number.max(1)).ok_or_else(invalid)
}

fn parse_threads(flag: &str, value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(threads) if threads > 0 => Ok(threads),
        _ => Err(AppError::InvalidValue {
            flag: flag.to_string(),
            value: value.to_string(),
            reason: "must be a positive integer".to_string(),
        }),
    }
}

fn map_clap_error(error: clap::Error) -> AppError {
    let kind = error.kind();
    let rendered = error.to_string();
    match kind {
        ErrorKind::UnknownArgument => AppError::UnsupportedArgument {
            arg: first_quoted_token(&rendered).unwrap_or(rendered),
        },
        ErrorKind::TooFewValues | ErrorKind::WrongNumberOfValues | ErrorKind::InvalidValue => {
            AppError::MissingValue {
                flag: first_quoted_token(&rendered).unwrap_or_else(|| "argument".to_string()),
            }
        }
        ErrorKind::MissingRequiredArgument => AppError::MissingRequired {
            field: first_quoted_token(&rendered).unwrap_or_else(|| clap_error_message(&rendered)),
        },
        _ => AppError::ParseError {
            message: clap_error_message(&rendered),
        },
    }
}

fn first_quoted_token(message: &str) -> Option<String> {
    let start = message.find('\'')?;
    let end = message[start + 1..].find('\'')?;
    Some(message[start + 1..start + 1 + end].to_string())
}

fn clap_error_message(message: &str) -> String {
    message
        .lines()
        .find_map(|line| line.strip_prefix("error: "))
        .or_else(|| message.lines().next())
        .unwrap_or("failed to parse arguments")
        .to_string()
}
