//! Entry-point for the `courier-exec` binary.
//!
//! A headless front-end for the courier execution core: it runs one prompt
//! through the configured agent back-end, prints stream updates as they
//! arrive, and writes the final result to stdout. Useful on its own in CI
//! and as the reference consumer of the core API.
use clap::Parser;
use courier_exec::Cli;
use courier_exec::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_main(cli).await
}
