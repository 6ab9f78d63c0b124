use observability_operator::config::Cli;
use observability_operator::logging::init_logging;
use observability_operator::run_from_cli;
use std::process;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    if let Err(e) = init_logging(&cli.log_level, &cli.log_format) {
        eprintln!("error: {e}");
        process::exit(1);
    }
    // Failures are logged where they happen; only the exit status is left.
    if let Err(e) = run_from_cli(&cli).await {
        process::exit(e.exit_code());
    }
}
