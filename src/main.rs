/// Binlog relay 수신 프로세스
///
/// 업스트림 마스터에서 이벤트를 받아 datadir에 저장한다. Ctrl-C로 종료한다.
use binlog_relay::{Config, ConnectionConfig, Inventory, MariaDbConnection, Writer};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    if let Ok(path) = env::var("RELAY_CONFIG") {
        return Ok(Config::from_json_file(Path::new(&path))?);
    }

    let mut config = Config::new(env::var("RELAY_DATADIR").unwrap_or_else(|_| "/var/lib/binlog_relay".to_string()));
    config.server_id = env::var("RELAY_SERVER_ID")
        .unwrap_or_else(|_| "1234".to_string())
        .parse()
        .unwrap_or(1234);
    config.bootstrap_gtid_list = env::var("RELAY_BOOTSTRAP_GTID").unwrap_or_default();
    config.upstream = ConnectionConfig {
        hostname: env::var("UPSTREAM_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("UPSTREAM_PORT")
            .unwrap_or_else(|_| "3306".to_string())
            .parse()
            .unwrap_or(3306),
        username: env::var("UPSTREAM_USER").unwrap_or_else(|_| "repl".to_string()),
        password: env::var("UPSTREAM_PASSWORD").unwrap_or_default(),
        ..Default::default()
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = load_config()?;
    config.validate()?;
    std::fs::create_dir_all(&config.datadir)?;

    info!("Starting binlog relay in {}", config.datadir.display());
    info!("Upstream: {}", config.upstream.address());

    let inventory = Arc::new(Inventory::open(&config)?);
    let connection = MariaDbConnection::new(config.upstream.clone());
    let handle = Writer::new(config, inventory, connection)?.spawn()?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown requested");
        }
        _ = wait_for_exit(&handle) => {}
    }

    let gtid_list = handle.gtid_list();
    match handle.stop() {
        Ok(()) => {
            info!("Relay stopped at '{}'", gtid_list);
            Ok(())
        }
        Err(e) => {
            error!("Writer failed: {}", e);
            Err(e.into())
        }
    }
}

/// Writer 스레드가 스스로 끝날 때까지 대기 (치명적 에러)
async fn wait_for_exit(handle: &binlog_relay::WriterHandle) {
    let mut state = handle.subscribe_state();
    while !handle.is_finished() {
        if state.changed().await.is_err() {
            break;
        }
    }
}
