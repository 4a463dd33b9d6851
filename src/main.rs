use clap::Parser;
use study_pulse_lib::Cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "study_pulse_lib=info".into()),
        )
        .init();

    let cli = Cli::parse();
    study_pulse_lib::run(cli)?;
    Ok(())
}
