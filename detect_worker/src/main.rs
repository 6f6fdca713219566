use std::{
    io::{self, Read, Write},
    process::ExitCode,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    // stdout carries the result document, so diagnostics go to stderr only.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(false)
                .with_target(false)
                .without_time(),
        )
        .init();

    let mut input = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut input) {
        tracing::error!("failed to read stdin: {}", e);
        return ExitCode::FAILURE;
    }

    let result = match detect_worker::process(&input) {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut stdout = io::stdout().lock();
    let written = serde_json::to_writer(&mut stdout, &result)
        .map_err(io::Error::from)
        .and_then(|()| writeln!(stdout))
        .and_then(|()| stdout.flush());
    if let Err(e) = written {
        tracing::error!("failed to write result: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
