use std::process::ExitCode;

#[cfg(feature = "mimalloc-allocator")]
use mimalloc::MiMalloc;

#[cfg(feature = "mimalloc-allocator")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    atacseq_pipeline::init_tracing();
    match atacseq_pipeline::cli::parse_from_env().and_then(atacseq_pipeline::run_from_args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("atacseq: {error}");
            ExitCode::from(1)
        }
    }
}
