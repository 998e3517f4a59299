// clipkeep - local clipboard-history core
//
// The binary is a thin shell over the library: parse arguments, set up
// tracing (stderr + rotated file under the data root), run the subcommand,
// exit with the documented code (0 ok, 1 bad args, 2 DB error, 3 timeout).

use clap::error::ErrorKind;
use clap::Parser;
use clipkeep::cli::{self, Cli};
use clipkeep::config::DataPaths;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help/--version are successes, everything else is bad args.
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // File logging is best-effort: a read-only data dir must not stop the
    // CLI from running.
    let _log_guard = init_tracing();

    let code = cli::run(cli).await;
    std::process::exit(code);
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_writer = DataPaths::from_env().ok().and_then(|paths| {
        std::fs::create_dir_all(paths.log_dir()).ok()?;
        let appender = tracing_appender::rolling::daily(paths.log_dir(), "clipkeep.log");
        Some(tracing_appender::non_blocking(appender))
    });

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    match file_writer {
        Some((writer, guard)) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}
