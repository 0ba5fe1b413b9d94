//! 복제 이벤트 타입 및 데이터 구조 정의
//!
//! 이벤트 본문은 대부분 불투명한 바이트로 취급한다. 상태 전이를 일으키는
//! GTID, QUERY, XID, ROTATE, HEARTBEAT 이벤트만 해석한다.

use crate::binlog::{self, BinlogParser, EVENT_HEADER_SIZE};
use crate::error::{RelayError, Result};
use crate::gtid::Gtid;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// MariaDB 복제 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN, COMMIT)
    QueryEvent = 2,
    StopEvent = 3,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    FormatDescriptionEvent = 15,
    /// 트랜잭션 커밋
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    /// 마스터가 유휴 상태일 때 보내는 하트비트
    HeartbeatEvent = 27,
    AnnotateRowsEvent = 160,
    BinlogCheckpointEvent = 161,
    /// GTID 이벤트 (트랜잭션 시작)
    GtidEvent = 162,
    GtidListEvent = 163,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            160 => EventType::AnnotateRowsEvent,
            161 => EventType::BinlogCheckpointEvent,
            162 => EventType::GtidEvent,
            163 => EventType::GtidListEvent,
            _ => EventType::Unknown,
        }
    }
}

/// 복제 이벤트 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 원본 타입 코드 (알 수 없는 타입도 보존)
    pub type_code: u8,
    pub event_type: EventType,
    pub server_id: u32,
    /// 헤더를 포함한 이벤트 길이 (바이트)
    pub event_length: u32,
    /// 다음 이벤트 위치
    pub next_pos: u32,
    pub flags: u16,
}

/// GTID 이벤트 데이터
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidEventData {
    pub sequence_nr: u64,
    pub domain_id: u32,
    pub flags: u8,
}

impl GtidEventData {
    /// BEGIN 없이 단일 쿼리로 끝나는 트랜잭션 (DDL 등)
    pub const FL_STANDALONE: u8 = 0x01;

    pub fn is_standalone(&self) -> bool {
        self.flags & Self::FL_STANDALONE != 0
    }
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    pub thread_id: u32,
    pub exec_time: u32,
    pub database: String,
    pub query: String,
}

impl QueryEventData {
    /// 트랜잭션을 끝내는 COMMIT 쿼리인지
    pub fn is_commit(&self) -> bool {
        self.query.trim().eq_ignore_ascii_case("COMMIT")
    }
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    pub next_binlog_name: String,
    pub position: u64,
}

/// 헤더와 원본 바이트를 함께 가진 복제 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RplEvent {
    header: EventHeader,
    raw: Bytes,
}

impl RplEvent {
    /// 헤더를 포함한 원본 이벤트 바이트로부터 생성
    pub fn from_raw(raw: impl Into<Bytes>) -> Result<Self> {
        let raw = raw.into();
        let (header, _) = BinlogParser::parse_header(&raw)?;
        if header.event_length as usize != raw.len() {
            return Err(RelayError::BinlogParseError(format!(
                "Event length mismatch: header says {}, got {} bytes",
                header.event_length,
                raw.len()
            )));
        }
        Ok(RplEvent { header, raw })
    }

    /// 구독자에게 보내는 합성 하트비트 이벤트
    ///
    /// 헤더의 위치 필드는 32비트라서 그보다 큰 위치는 `u32::MAX`로 보낸다.
    pub fn heartbeat(server_id: u32, file_name: &str, position: u64) -> Self {
        let position = u32::try_from(position).unwrap_or(u32::MAX);
        let raw = binlog::encode_event(
            EventType::HeartbeatEvent as u8,
            server_id,
            0,
            position,
            binlog::LOG_EVENT_ARTIFICIAL_F,
            file_name.as_bytes(),
        );
        let header = EventHeader {
            timestamp: 0,
            type_code: EventType::HeartbeatEvent as u8,
            event_type: EventType::HeartbeatEvent,
            server_id,
            event_length: raw.len() as u32,
            next_pos: position,
            flags: binlog::LOG_EVENT_ARTIFICIAL_F,
        };
        RplEvent {
            header,
            raw: Bytes::from(raw),
        }
    }

    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }

    pub fn server_id(&self) -> u32 {
        self.header.server_id
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// 헤더 뒤의 본문
    pub fn body(&self) -> &[u8] {
        &self.raw[EVENT_HEADER_SIZE..]
    }

    pub fn is_heartbeat(&self) -> bool {
        self.header.event_type == EventType::HeartbeatEvent
    }

    /// 마스터가 스트림 시작 시 만들어 보내는 가짜 이벤트
    pub fn is_artificial(&self) -> bool {
        self.header.flags & binlog::LOG_EVENT_ARTIFICIAL_F != 0 || self.header.timestamp == 0
    }

    /// GTID 이벤트라면 GTID로 변환
    pub fn gtid(&self) -> Result<Option<(Gtid, GtidEventData)>> {
        if self.event_type() != EventType::GtidEvent {
            return Ok(None);
        }
        let data = BinlogParser::parse_gtid_event(self.body())?;
        Ok(Some((
            Gtid::new(data.domain_id, self.server_id(), data.sequence_nr),
            data,
        )))
    }

    /// next_pos 헤더 필드를 바꾼 복사본
    pub fn with_next_pos(&self, next_pos: u32) -> Self {
        let mut raw = self.raw.to_vec();
        raw[13..17].copy_from_slice(&next_pos.to_le_bytes());
        let mut header = self.header.clone();
        header.next_pos = next_pos;
        RplEvent {
            header,
            raw: Bytes::from(raw),
        }
    }
}
