//! 테스트용 이벤트 생성기

use crate::binlog;
use crate::config::Config;
use crate::events::{EventType, GtidEventData, RplEvent};
use std::path::Path;
use std::time::Duration;

pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::new(dir);
    config.notify_poll_interval = Duration::from_millis(20);
    config.heartbeat_interval = Duration::from_millis(100);
    config.reconnect_initial_backoff = Duration::from_millis(10);
    config.reconnect_max_backoff = Duration::from_millis(40);
    config
}

fn event(event_type: EventType, server_id: u32, body: &[u8]) -> RplEvent {
    RplEvent::from_raw(binlog::encode_event(event_type as u8, server_id, 1_600_000_000, 0, 0, body))
        .expect("well-formed test event")
}

pub fn gtid_event(domain_id: u32, server_id: u32, sequence_nr: u64) -> RplEvent {
    event(
        EventType::GtidEvent,
        server_id,
        &binlog::gtid_event_body(sequence_nr, domain_id, 0),
    )
}

pub fn ddl_gtid_event(domain_id: u32, server_id: u32, sequence_nr: u64) -> RplEvent {
    event(
        EventType::GtidEvent,
        server_id,
        &binlog::gtid_event_body(sequence_nr, domain_id, GtidEventData::FL_STANDALONE),
    )
}

pub fn query_event(server_id: u32, query: &str) -> RplEvent {
    event(EventType::QueryEvent, server_id, &binlog::query_event_body("test", query))
}

pub fn xid_event(server_id: u32, xid: u64) -> RplEvent {
    event(EventType::XidEvent, server_id, &binlog::xid_event_body(xid))
}

pub fn rows_event(server_id: u32, payload: &[u8]) -> RplEvent {
    event(EventType::WriteRowsEventV1, server_id, payload)
}

/// GTID, BEGIN, 행 이벤트, XID 로 이루어진 트랜잭션 하나
pub fn transaction(domain_id: u32, server_id: u32, sequence_nr: u64) -> Vec<RplEvent> {
    vec![
        gtid_event(domain_id, server_id, sequence_nr),
        query_event(server_id, "BEGIN"),
        rows_event(server_id, &sequence_nr.to_le_bytes()),
        xid_event(server_id, sequence_nr),
    ]
}

/// MariaDB 10.6 형식의 greeting 패킷
pub fn greeting_bytes(scramble: &[u8; 20]) -> Vec<u8> {
    let mut data = vec![10];
    data.extend_from_slice(b"10.6.12-MariaDB\0");
    data.extend_from_slice(&42u32.to_le_bytes());
    data.extend_from_slice(&scramble[..8]);
    data.push(0);
    data.extend_from_slice(&0xf7feu16.to_le_bytes());
    data.push(8);
    data.extend_from_slice(&2u16.to_le_bytes());
    data.extend_from_slice(&0x81bfu16.to_le_bytes());
    data.push(21);
    data.extend_from_slice(&[0u8; 10]);
    data.extend_from_slice(&scramble[8..]);
    data.push(0);
    data.extend_from_slice(b"mysql_native_password\0");
    data
}

/// 세그먼트의 완전한 이벤트 전부
pub fn read_segment(path: &Path) -> Vec<RplEvent> {
    let mut file = std::fs::File::open(path).expect("segment exists");
    binlog::verify_segment(&mut file).expect("segment magic");
    let mut pos = binlog::BINLOG_MAGIC.len() as u64;
    let mut events = Vec::new();
    while let Ok(binlog::ReadOutcome::Event(event)) = binlog::read_event_at(&mut file, pos) {
        pos += event.len() as u64;
        events.push(event);
    }
    events
}
