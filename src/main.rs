use std::env;

use aex_store::Store;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_tracing();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();

    if cmd == "audit-verify" {
        let mut db_path = String::from("./aex.db");
        let mut scope = String::from("default");
        while let Some(arg) = args.next() {
            if arg == "--db" {
                if let Some(v) = args.next() {
                    db_path = v;
                }
            }
            if arg == "--scope" {
                if let Some(v) = args.next() {
                    scope = v;
                }
            }
        }
        let store = match Store::open(&db_path, &scope) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("failed to open store: {e}");
                std::process::exit(1);
            }
        };
        match store.replay_verify() {
            Ok(report) if report.ok() => {
                println!(
                    "audit ok: {} events verified, spend reconciled",
                    report.events_checked
                );
                return;
            }
            Ok(report) => {
                for m in &report.chain_mismatches {
                    eprintln!("chain mismatch at scope={} seq={}: {}", m.chain_scope, m.seq, m.detail);
                }
                for m in &report.spend_mismatches {
                    eprintln!(
                        "spend mismatch for {}: {} replay={} live={}",
                        m.agent_id, m.field, m.replayed, m.live
                    );
                }
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("audit failed: {e}");
                std::process::exit(1);
            }
        }
    }

    if cmd != "serve" {
        eprintln!("Usage: aex serve --config <path> | aex audit-verify --db <path> [--scope <scope>]");
        std::process::exit(2);
    }

    let mut config_path = aex_config::config_dir()
        .join("aex.yaml")
        .to_string_lossy()
        .to_string();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match aex_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = aex_server::serve(cfg).await {
        eprintln!("server exited with error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match env::var("AEX_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let path = std::path::Path::new(&dir).join("aex.log");
            match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    builder
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file))
                        .init();
                }
                Err(err) => {
                    eprintln!("cannot open log file {}: {err}; logging to stderr", path.display());
                    tracing_subscriber::fmt()
                        .with_env_filter(
                            EnvFilter::try_from_default_env()
                                .unwrap_or_else(|_| EnvFilter::new("info")),
                        )
                        .init();
                }
            }
        }
        _ => builder.init(),
    }
}
