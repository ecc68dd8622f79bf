pub use clap::Parser;
use physio_bridge::{args, hkh, hub, mirror, polar};
use tracing_subscriber::{fmt, layer::SubscriberExt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    // Setup the error handler
    color_eyre::install()?;
    // Get the CLI options
    let cli = args::Cli::parse();
    // Logs go to stderr; stdout is reserved for heartbeats and operator lines
    // the supervisor consumes
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match cli.role {
        None => hub::run(&cli).await,
        Some(args::Role::Polar(a)) => polar::run(a).await,
        Some(args::Role::Mirror(a)) => mirror::run(a).await,
        Some(args::Role::Hkh(a)) => match hkh::run(a).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.downcast_ref::<hkh::Error>()
                    .is_some_and(|err| matches!(err, hkh::Error::NoPort(_)))
                {
                    eprintln!("[FATAL] {e}");
                    std::process::exit(3);
                }
                Err(e)
            }
        },
    }
}
