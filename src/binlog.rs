//! 세그먼트 파일의 이벤트 프레이밍
//!
//! 헤더: 4 바이트 매직 넘버 (0xfe 0x62 0x69 0x6e)
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes, 헤더 포함)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)

use crate::error::{RelayError, Result};
use crate::events::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};

pub const BINLOG_MAGIC: [u8; 4] = [0xfe, 0x62, 0x69, 0x6e]; // ".bin" in ASCII
pub const EVENT_HEADER_SIZE: usize = 19;

/// 마스터가 실제 binlog에 없는 이벤트를 만들었다는 표시
pub const LOG_EVENT_ARTIFICIAL_F: u16 = 0x20;

/// 이벤트 파서
pub struct BinlogParser;

impl BinlogParser {
    /// 세그먼트 파일 헤더 검증
    pub fn verify_magic(data: &[u8]) -> Result<()> {
        if data.len() < BINLOG_MAGIC.len() {
            return Err(RelayError::BinlogParseError(
                "Invalid binlog: too short".to_string(),
            ));
        }

        if data[0..4] == BINLOG_MAGIC[..] {
            Ok(())
        } else {
            Err(RelayError::BinlogParseError(
                "Invalid binlog magic number".to_string(),
            ))
        }
    }

    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8]) -> Result<(EventHeader, usize)> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(RelayError::BinlogParseError(
                "Invalid event header: too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let type_code = cursor.read_u8()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let event_length = cursor.read_u32::<LittleEndian>()?;
        let next_pos = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        if (event_length as usize) < EVENT_HEADER_SIZE {
            return Err(RelayError::BinlogParseError(format!(
                "Invalid event length: {}",
                event_length
            )));
        }

        Ok((
            EventHeader {
                timestamp,
                type_code,
                event_type: EventType::from_u8(type_code),
                server_id,
                event_length,
                next_pos,
                flags,
            },
            cursor.position() as usize,
        ))
    }

    /// MariaDB GTID 이벤트 본문 파싱 (162)
    pub fn parse_gtid_event(data: &[u8]) -> Result<GtidEventData> {
        if data.len() < 13 {
            return Err(RelayError::BinlogParseError(
                "Invalid GTID event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let sequence_nr = cursor.read_u64::<LittleEndian>()?;
        let domain_id = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u8()?;

        Ok(GtidEventData {
            sequence_nr,
            domain_id,
            flags,
        })
    }

    /// QUERY 이벤트 파싱 (2)
    pub fn parse_query_event(data: &[u8]) -> Result<QueryEventData> {
        if data.len() < 13 {
            return Err(RelayError::BinlogParseError(
                "Invalid query event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let thread_id = cursor.read_u32::<LittleEndian>()?;
        let exec_time = cursor.read_u32::<LittleEndian>()?;
        let db_len = cursor.read_u8()? as usize;
        let _error_code = cursor.read_u16::<LittleEndian>()?;
        let status_len = cursor.read_u16::<LittleEndian>()? as usize;

        // Status variables skip
        cursor.set_position(cursor.position() + status_len as u64);

        let mut db_bytes = vec![0u8; db_len];
        if db_len > 0 {
            cursor.read_exact(&mut db_bytes)?;
        }
        let database = String::from_utf8_lossy(&db_bytes).to_string();

        // null terminator skip
        cursor.read_u8()?;

        let remaining = &data[cursor.position() as usize..];
        let query = String::from_utf8_lossy(remaining).to_string();

        Ok(QueryEventData {
            thread_id,
            exec_time,
            database,
            query,
        })
    }

    /// ROTATE 이벤트 파싱 (4)
    pub fn parse_rotate_event(data: &[u8]) -> Result<RotateEventData> {
        if data.len() < 8 {
            return Err(RelayError::BinlogParseError(
                "Invalid rotate event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let position = cursor.read_u64::<LittleEndian>()?;
        let filename_bytes = &data[cursor.position() as usize..];
        let filename = String::from_utf8_lossy(filename_bytes).to_string();

        Ok(RotateEventData {
            next_binlog_name: filename,
            position,
        })
    }
}

/// 헤더와 본문으로 원본 이벤트 바이트 생성
pub fn encode_event(
    type_code: u8,
    server_id: u32,
    timestamp: u32,
    next_pos: u32,
    flags: u16,
    body: &[u8],
) -> Vec<u8> {
    let event_length = (EVENT_HEADER_SIZE + body.len()) as u32;
    let mut buffer = Vec::with_capacity(event_length as usize);

    // Vec<u8>에 쓰기는 실패하지 않는다
    let _ = buffer.write_u32::<LittleEndian>(timestamp);
    let _ = buffer.write_u8(type_code);
    let _ = buffer.write_u32::<LittleEndian>(server_id);
    let _ = buffer.write_u32::<LittleEndian>(event_length);
    let _ = buffer.write_u32::<LittleEndian>(next_pos);
    let _ = buffer.write_u16::<LittleEndian>(flags);
    buffer.extend_from_slice(body);

    buffer
}

pub fn gtid_event_body(sequence_nr: u64, domain_id: u32, flags: u8) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(19);
    let _ = buffer.write_u64::<LittleEndian>(sequence_nr);
    let _ = buffer.write_u32::<LittleEndian>(domain_id);
    let _ = buffer.write_u8(flags);
    // commit_id 자리 (group commit 미사용)
    buffer.extend_from_slice(&[0u8; 6]);
    buffer
}

pub fn query_event_body(database: &str, query: &str) -> Vec<u8> {
    let mut buffer = Vec::new();
    let _ = buffer.write_u32::<LittleEndian>(0); // thread id
    let _ = buffer.write_u32::<LittleEndian>(0); // exec time
    let _ = buffer.write_u8(database.len() as u8);
    let _ = buffer.write_u16::<LittleEndian>(0); // error code
    let _ = buffer.write_u16::<LittleEndian>(0); // status vars length
    buffer.extend_from_slice(database.as_bytes());
    buffer.push(0);
    buffer.extend_from_slice(query.as_bytes());
    buffer
}

pub fn xid_event_body(xid: u64) -> Vec<u8> {
    xid.to_le_bytes().to_vec()
}

pub fn rotate_event_body(position: u64, next_binlog_name: &str) -> Vec<u8> {
    let mut buffer = position.to_le_bytes().to_vec();
    buffer.extend_from_slice(next_binlog_name.as_bytes());
    buffer
}

/// 파일의 한 위치에서 이벤트를 읽은 결과
#[derive(Debug)]
pub enum ReadOutcome {
    Event(RplEvent),
    /// 이벤트 일부만 기록되어 있음 (쓰는 중이거나 잘림)
    Incomplete,
    End,
}

/// `pos`에서 이벤트 하나를 읽는다. 파일 길이는 매번 다시 확인한다
pub fn read_event_at(file: &mut File, pos: u64) -> Result<ReadOutcome> {
    let file_len = file.metadata()?.len();
    if pos >= file_len {
        return Ok(ReadOutcome::End);
    }
    if file_len - pos < EVENT_HEADER_SIZE as u64 {
        return Ok(ReadOutcome::Incomplete);
    }

    let mut header_buf = [0u8; EVENT_HEADER_SIZE];
    file.seek(SeekFrom::Start(pos))?;
    file.read_exact(&mut header_buf)?;
    let (header, _) = BinlogParser::parse_header(&header_buf)?;

    let event_length = header.event_length as u64;
    if file_len - pos < event_length {
        return Ok(ReadOutcome::Incomplete);
    }

    let mut raw = vec![0u8; event_length as usize];
    raw[..EVENT_HEADER_SIZE].copy_from_slice(&header_buf);
    file.read_exact(&mut raw[EVENT_HEADER_SIZE..])?;

    Ok(ReadOutcome::Event(RplEvent::from_raw(raw)?))
}

/// 세그먼트 파일 앞부분의 매직 넘버 검증
pub fn verify_segment(file: &mut File) -> Result<()> {
    let mut magic = [0u8; 4];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut magic)?;
    BinlogParser::verify_magic(&magic)
}
