//! MariaDB binlog relay 저장 엔진
//!
//! 업스트림 마스터에서 복제 이벤트를 받아 로컬 세그먼트 파일에 순서대로 저장하고,
//! 여러 구독자에게 원하는 GTID 위치부터 다시 보내준다.
//! 주요 기능:
//! - GTID 기반 재시작 (상태 파일)
//! - 세그먼트 회전과 Inventory 관리
//! - 구독자별 하트비트와 흐름 제어
//! - 업스트림 재접속

pub mod admin;
pub mod auth;
pub mod binlog;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod file_reader;
pub mod file_writer;
pub mod gtid;
pub mod inventory;
pub mod notify;
pub mod offset;
pub mod protocol;
pub mod reader;
pub mod worker;
pub mod writer;

#[cfg(test)]
mod test_util;

pub use config::{Config, ConnectionConfig};
pub use connection::{Connection, MariaDbConnection};
pub use error::{RelayError, Result};
pub use events::{EventType, RplEvent};
pub use file_reader::FileReader;
pub use file_writer::FileWriter;
pub use gtid::{Gtid, GtidList};
pub use inventory::Inventory;
pub use offset::WriterState;
pub use reader::Reader;
pub use worker::Worker;
pub use writer::{ShutdownSignal, Writer, WriterHandle};
