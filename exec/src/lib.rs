mod cli;
mod event_processor;

use std::io::IsTerminal;
use std::io::Read;
use std::sync::Arc;

pub use cli::Cli;
use courier_core::AgentFacade;
use courier_core::config::Config;
use courier_core::sink::ChannelSink;
use courier_protocol::AgentRequest;
use event_processor::EventProcessor;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        config,
        cwd,
        session,
        continue_latest,
        user,
        color,
        prompt,
    } = cli;

    // Determine the prompt based on CLI arg and/or stdin.
    let prompt = match prompt {
        Some(p) if p != "-" => p,
        // Either `-` was passed or no positional arg.
        maybe_dash => {
            let force_stdin = matches!(maybe_dash.as_deref(), Some("-"));
            if std::io::stdin().is_terminal() && !force_stdin {
                if continue_latest {
                    // Continuing a session works without a fresh prompt.
                    String::new()
                } else {
                    eprintln!(
                        "No prompt provided. Either specify one as an argument or pipe the prompt into stdin."
                    );
                    std::process::exit(1);
                }
            } else {
                if !force_stdin {
                    eprintln!("Reading prompt from stdin...");
                }
                let mut buffer = String::new();
                if let Err(e) = std::io::stdin().read_to_string(&mut buffer) {
                    eprintln!("Failed to read prompt from stdin: {e}");
                    std::process::exit(1);
                } else if buffer.trim().is_empty() && !continue_latest {
                    eprintln!("No prompt provided via stdin.");
                    std::process::exit(1);
                }
                buffer
            }
        }
    };

    let stdout_with_ansi = match color {
        cli::Color::Always => true,
        cli::Color::Never => false,
        cli::Color::Auto => std::io::stdout().is_terminal(),
    };

    let default_filter = "error";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let working_directory = match cwd {
        Some(dir) => dir.canonicalize().unwrap_or(dir),
        None => std::env::current_dir()?,
    };

    let config = match config {
        Some(path) => Config::load(&path)?,
        None => Config::with_approved_directory(working_directory.clone())?,
    };

    let facade = Arc::new(AgentFacade::new(Arc::new(config)));

    // Ctrl-C tears down any active agent child before exiting.
    let interrupt = courier_core::util::notify_on_sigint();
    tokio::spawn({
        let facade = Arc::clone(&facade);
        async move {
            interrupt.notified().await;
            facade.shutdown().await;
            std::process::exit(130);
        }
    });

    let (sink, mut rx) = ChannelSink::new();
    let printer = tokio::spawn(async move {
        let mut processor = EventProcessor::create_with_ansi(stdout_with_ansi);
        while let Some(update) = rx.recv().await {
            processor.process_update(update);
        }
    });

    let response = if continue_latest {
        match facade
            .continue_session(user, &working_directory, Some(prompt), Some(sink))
            .await?
        {
            Some(response) => response,
            None => {
                eprintln!("No session to continue in {}.", working_directory.display());
                std::process::exit(1);
            }
        }
    } else {
        facade
            .run(
                AgentRequest {
                    prompt,
                    working_directory: working_directory.clone(),
                    user_id: user,
                    session_id: session,
                    continue_session: false,
                },
                Some(sink),
            )
            .await?
    };

    debug!(session_id = %response.session_id, "run finished");
    let _ = printer.await;

    println!("{}", response.content);
    if response.is_error {
        std::process::exit(1);
    }
    Ok(())
}
