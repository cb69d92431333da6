use std::path::PathBuf;
use telewatch::supervisor::{self, RunError};
use telewatch_common::config::Config;
use telewatch_notify::telegram::TelegramTransport;
use telewatch_notify::Transport;
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_RUNTIME_ERROR: i32 = 3;

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  telewatch [config.yaml]                     Start monitoring");
    eprintln!("  telewatch test-notification [config.yaml]   Send one test message and exit");
}

fn default_config_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("telewatch")
        .join("config.yaml")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("telewatch=info".parse().expect("valid directive")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let code = match args.get(1).map(|s| s.as_str()) {
        Some("--help" | "-h") => {
            print_usage();
            0
        }
        Some("test-notification") => {
            let path = args
                .get(2)
                .map(PathBuf::from)
                .unwrap_or_else(default_config_path);
            run_test_notification(&path).await
        }
        other => {
            let path = other
                .map(PathBuf::from)
                .unwrap_or_else(default_config_path);
            run_monitor(&path).await
        }
    };
    std::process::exit(code);
}

async fn run_monitor(config_path: &std::path::Path) -> i32 {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return EXIT_CONFIG_ERROR;
        }
    };

    tracing::info!(config = %config_path.display(), "telewatch starting");

    match supervisor::run(config).await {
        Ok(()) => {
            tracing::info!("telewatch stopped");
            0
        }
        Err(RunError::Startup(e)) => {
            eprintln!("startup error: {e:#}");
            EXIT_CONFIG_ERROR
        }
        Err(RunError::Runtime(e)) => {
            eprintln!("runtime error: {e:#}");
            EXIT_RUNTIME_ERROR
        }
    }
}

async fn run_test_notification(config_path: &std::path::Path) -> i32 {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return EXIT_CONFIG_ERROR;
        }
    };
    let transport =
        match TelegramTransport::new(&config.telegram.bot_token, &config.telegram.chat_id) {
            Ok(transport) => transport,
            Err(e) => {
                eprintln!("configuration error: {e}");
                return EXIT_CONFIG_ERROR;
            }
        };
    match transport
        .send("🤖 TeleWatch test message. Your monitoring setup is wired correctly.")
        .await
    {
        Ok(()) => {
            println!("test message sent");
            0
        }
        Err(e) => {
            eprintln!("failed to send test message: {e}");
            EXIT_RUNTIME_ERROR
        }
    }
}
