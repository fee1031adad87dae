use clap::Parser;
use optrode::{app::App, args::Args, Error};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(&args).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => match err.downcast_ref::<Error>() {
            Some(e) => {
                if e.is_startup() {
                    tracing::error!("FPGA not available: {err:#}");
                } else {
                    tracing::error!("{err:#}");
                }
                ExitCode::from(e.exit_code())
            }
            None => {
                tracing::error!("{err:#}");
                ExitCode::from(1)
            }
        },
    }
}

async fn run(args: &Args) -> anyhow::Result<u8> {
    Ok(App::new(args)?.run().await?.exit_code())
}
