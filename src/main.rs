use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vigil::cli::Cli;
use vigil::config::file as config_file;
use vigil::core::probes::builtin_registry;
use vigil::{Engine, EngineError};

// Exit codes: 0 clean shutdown, 2 configuration invalid,
// 3 unrecoverable store error, 4 coordinator could neither acquire nor follow.
const EXIT_CONFIG: i32 = 2;
const EXIT_STORE: i32 = 3;
const EXIT_COORDINATOR: i32 = 4;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match config_file::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration load failed");
            return EXIT_CONFIG;
        }
    };

    let registry = match builtin_registry() {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "probe registry setup failed");
            return EXIT_STORE;
        }
    };

    let engine = match Engine::new(cli.workspace.clone(), config, registry) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            return EXIT_CONFIG;
        }
    };

    if cli.check_config {
        info!("configuration ok");
        return 0;
    }

    if let Err(e) = engine.start().await {
        return match e {
            EngineError::Config(err) => {
                error!(error = %err, "configuration invalid");
                EXIT_CONFIG
            }
            EngineError::Store(err) => {
                error!(error = %err, "store unavailable");
                EXIT_STORE
            }
            EngineError::Coordinator(err) => {
                error!(error = %err, "coordination failed");
                EXIT_COORDINATOR
            }
            other => {
                error!(error = %other, "engine start failed");
                EXIT_STORE
            }
        };
    }

    info!(workspace = %cli.workspace.display(), "monitoring; ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }

    engine.stop().await;
    0
}
