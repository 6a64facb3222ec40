pub mod cli;
pub mod errors;
pub mod external_tools;
pub mod genome;
pub mod pipeline;
pub mod qc;
pub mod shift;
pub mod stages;
pub mod steric;

use cli::PipelineArgs;
use errors::Result;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

pub fn run_from_args(args: PipelineArgs) -> Result<()> {
    pipeline::run(&args).map(|_| ())
}

#[cfg(test)]
mod tests {
    use crate::cli::parse_args;
    use crate::errors::AppError;

    #[test]
    fn wiring_parses_and_reports_missing_tools_before_running() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let output = dir.path().join("out").to_string_lossy().to_string();

        let args = parse_args([
            "atacseq",
            "--reads",
            "r1.fastq.gz:r2.fastq.gz",
            "--output",
            &output,
            "--lib",
            "wiring",
            "--step",
            "6",
            "--make-tag-directory",
            "makeTagDirectory_missing_for_wiring_test",
        ])
        .expect("expected valid args");

        let result = crate::run_from_args(args);
        assert!(matches!(result, Err(AppError::CommandNotFound { .. })));
        assert!(dir.path().join("out").join("logs").is_dir());
        assert!(!dir.path().join("out").join("logs").join("qc_metrics.txt").exists());
    }
}
