use std::env;
use std::path::PathBuf;

use chrono::Local;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: phab-relay serve\n       phab-relay report [--days <n>] [--prefix <phid-prefix>] [--dir <log-dir>]";

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_else(|| "serve".to_string());
    match cmd.as_str() {
        "serve" => serve().await,
        "report" => report(args),
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn serve() {
    let cfg = match relay_config::load_from_env() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(cfg.debug);

    if let Err(e) = relay_server::serve(cfg).await {
        eprintln!("server exited with error: {e}");
        std::process::exit(1);
    }
}

fn report(mut args: impl Iterator<Item = String>) {
    let mut days: u64 = 30;
    let mut prefix = String::from("PHID-USER-");
    let mut dir = env::var(relay_config::FEED_LOG_KEY)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| ".".to_string());
    while let Some(arg) = args.next() {
        let value = args.next();
        match (arg.as_str(), value) {
            ("--days", Some(v)) => match v.parse() {
                Ok(n) => days = n,
                Err(_) => {
                    eprintln!("--days expects a number, got {v:?}");
                    std::process::exit(2);
                }
            },
            ("--prefix", Some(v)) => prefix = v,
            ("--dir", Some(v)) => dir = v,
            _ => {
                eprintln!("{USAGE}");
                std::process::exit(2);
            }
        }
    }

    let today = Local::now().date_naive();
    match relay_server::activity::mention_report(&PathBuf::from(&dir), today, days, &prefix) {
        Ok(rows) => {
            for row in rows {
                println!("{row}");
            }
        }
        Err(e) => {
            eprintln!("report failed: {e}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
