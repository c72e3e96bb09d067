use clap::Parser;
use jersey_pipeline::{init_logging, run_pipeline, TrainJerseyArgs};

fn main() -> anyhow::Result<()> {
    let args = TrainJerseyArgs::parse();
    init_logging(args.verbose)?;
    let outcome = run_pipeline(&args)?;
    for artifact in &outcome.artifacts {
        println!(
            "{} -> {} ({} bytes)",
            artifact.format,
            artifact.path.display(),
            artifact.byte_size
        );
    }
    Ok(())
}
