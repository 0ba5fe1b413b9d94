//! Relay 설정

use crate::error::{RelayError, Result};
use crate::gtid::GtidList;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 업스트림 마스터 연결 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Relay 전체 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 세그먼트와 상태 파일이 놓이는 디렉터리
    pub datadir: PathBuf,
    /// 세그먼트 목록 파일 이름
    pub inventory_file: String,
    /// 복제 위치(GTID 목록) 파일 이름
    pub gtid_file: String,
    /// 세그먼트 파일 이름 접두사 (binlog.000001)
    pub binlog_basename: String,
    /// 상태 파일이 없을 때 복제를 시작할 위치
    pub bootstrap_gtid_list: String,
    /// 업스트림에 보고하는 이 relay의 server id
    pub server_id: u32,
    pub heartbeat_interval: Duration,
    /// 이 크기를 넘으면 다음 트랜잭션 시작 전에 세그먼트를 회전한다
    pub max_segment_size: u64,
    /// 변경 알림을 놓친 경우를 대비한 재확인 주기
    pub notify_poll_interval: Duration,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub upstream: ConnectionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            datadir: PathBuf::from("/var/lib/binlog_relay"),
            inventory_file: "binlog.index".to_string(),
            gtid_file: "rpl_state".to_string(),
            binlog_basename: "binlog".to_string(),
            bootstrap_gtid_list: String::new(),
            server_id: 1234,
            heartbeat_interval: Duration::from_secs(300),
            max_segment_size: 1 << 30,
            notify_poll_interval: Duration::from_secs(1),
            reconnect_initial_backoff: Duration::from_millis(500),
            reconnect_max_backoff: Duration::from_secs(30),
            upstream: ConnectionConfig::default(),
        }
    }
}

impl Config {
    pub fn new(datadir: impl Into<PathBuf>) -> Self {
        Config {
            datadir: datadir.into(),
            ..Default::default()
        }
    }

    /// JSON 설정 파일 읽기
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RelayError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.inventory_file.is_empty() || self.gtid_file.is_empty() {
            return Err(RelayError::ConfigError(
                "inventory_file and gtid_file must be set".to_string(),
            ));
        }
        if self.binlog_basename.is_empty() || self.binlog_basename.contains('/') {
            return Err(RelayError::ConfigError(format!(
                "Invalid binlog_basename: {:?}",
                self.binlog_basename
            )));
        }
        if !self.bootstrap_gtid_list().is_valid() {
            return Err(RelayError::ConfigError(format!(
                "Invalid bootstrap_gtid_list: {}",
                self.bootstrap_gtid_list
            )));
        }
        if self.reconnect_initial_backoff > self.reconnect_max_backoff {
            return Err(RelayError::ConfigError(
                "reconnect_initial_backoff exceeds reconnect_max_backoff".to_string(),
            ));
        }
        Ok(())
    }

    /// 상대 경로는 datadir 기준으로 해석
    pub fn path(&self, file_name: impl AsRef<Path>) -> PathBuf {
        let file_name = file_name.as_ref();
        if file_name.is_absolute() {
            file_name.to_path_buf()
        } else {
            self.datadir.join(file_name)
        }
    }

    pub fn inventory_file_path(&self) -> PathBuf {
        self.path(&self.inventory_file)
    }

    pub fn gtid_file_path(&self) -> PathBuf {
        self.path(&self.gtid_file)
    }

    pub fn bootstrap_gtid_list(&self) -> GtidList {
        GtidList::from_string(&self.bootstrap_gtid_list)
    }
}
