//! MySQL/MariaDB 클라이언트 프로토콜 패킷 처리

use crate::error::{RelayError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// 이 길이의 패킷 뒤에는 이어지는 패킷이 온다
pub const MAX_PACKET_LENGTH: usize = 0xffffff;

pub const COM_QUERY: u8 = 0x03;
pub const COM_PING: u8 = 0x0e;
pub const COM_BINLOG_DUMP: u8 = 0x12;

/// Annotate rows 이벤트 요청
pub const BINLOG_SEND_ANNOTATE_ROWS_EVENT: u16 = 2;

pub const OK_PACKET: u8 = 0x00;
pub const EOF_PACKET: u8 = 0xFE;
pub const ERROR_PACKET: u8 = 0xFF;

/// MySQL 패킷 채널
pub struct PacketChannel<S = TcpStream> {
    stream: S,
    sequence: u8,
}

impl PacketChannel<TcpStream> {
    /// TCP 연결
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            RelayError::ConnectionLost(format!("Failed to connect to {}: {}", address, e))
        })?;
        stream.set_nodelay(true)?;

        debug!("Connected to upstream at {}", address);
        Ok(PacketChannel::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketChannel<S> {
    pub fn new(stream: S) -> Self {
        PacketChannel { stream, sequence: 0 }
    }

    /// 논리 패킷 하나 읽기. 최대 길이 패킷은 이어지는 패킷과 합친다
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 4];
            self.stream.read_exact(&mut header).await.map_err(lost("read packet header"))?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .map_err(lost("read packet body"))?;

            if length < MAX_PACKET_LENGTH {
                return Ok(payload);
            }
        }
    }

    /// 응답 패킷 쓰기. 직전에 읽은 패킷 다음 sequence를 쓴다
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut chunks = data.chunks(MAX_PACKET_LENGTH).peekable();
        if chunks.peek().is_none() {
            self.write_chunk(&[]).await?;
        }
        while let Some(chunk) = chunks.next() {
            self.write_chunk(chunk).await?;
            if chunk.len() == MAX_PACKET_LENGTH && chunks.peek().is_none() {
                self.write_chunk(&[]).await?;
            }
        }
        self.stream.flush().await.map_err(lost("flush"))?;
        Ok(())
    }

    /// 새 명령 시작. sequence는 0부터 다시 센다
    pub async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        self.sequence = 0;
        self.write_packet(data).await
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let mut header = Vec::with_capacity(4);
        WriteBytesExt::write_u24::<LittleEndian>(&mut header, chunk.len() as u32)?;
        WriteBytesExt::write_u8(&mut header, self.sequence)?;
        self.sequence = self.sequence.wrapping_add(1);

        self.stream.write_all(&header).await.map_err(lost("write packet header"))?;
        self.stream.write_all(chunk).await.map_err(lost("write packet body"))?;
        Ok(())
    }
}

fn lost(what: &'static str) -> impl Fn(std::io::Error) -> RelayError {
    move |e| RelayError::ConnectionLost(format!("Failed to {}: {}", what, e))
}

/// Greeting 패킷
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if let Some(err) = ErrorPacket::parse(data) {
            return Err(RelayError::ProtocolError(format!("Server refused connection: {}", err)));
        }

        let mut cursor = std::io::Cursor::new(data);

        let protocol_version = ReadBytesExt::read_u8(&mut cursor).map_err(malformed("protocol version"))?;
        let server_version = read_null_terminated_string(&mut cursor)?;
        let thread_id = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor).map_err(malformed("thread id"))?;

        let mut scramble = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut scramble).map_err(malformed("scramble"))?;

        // filler
        ReadBytesExt::read_u8(&mut cursor).map_err(malformed("filler"))?;

        let capabilities_lower =
            ReadBytesExt::read_u16::<LittleEndian>(&mut cursor).map_err(malformed("capabilities"))?;
        let server_collation = ReadBytesExt::read_u8(&mut cursor).map_err(malformed("collation"))?;
        let server_status = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor).map_err(malformed("status"))?;
        let capabilities_upper =
            ReadBytesExt::read_u16::<LittleEndian>(&mut cursor).map_err(malformed("capabilities"))?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = ReadBytesExt::read_u8(&mut cursor).map_err(malformed("auth data length"))?;

        let mut reserved = [0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved).map_err(malformed("reserved"))?;

        // 나머지 scramble은 최소 13 바이트, 마지막 null 제외
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut part2 = vec![0u8; part2_len];
        Read::read_exact(&mut cursor, &mut part2).map_err(malformed("scramble"))?;
        scramble.extend_from_slice(&part2[..part2_len - 1]);

        let auth_plugin = if (cursor.position() as usize) < data.len() {
            read_null_terminated_string(&mut cursor).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin,
        })
    }
}

fn malformed(what: &'static str) -> impl Fn(std::io::Error) -> RelayError {
    move |e| RelayError::ProtocolError(format!("Failed to read {}: {}", what, e))
}

/// null로 끝나는 문자열 읽기. 끝에 null이 없으면 남은 전부
fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        match ReadBytesExt::read_u8(reader) {
            Ok(0) => break,
            Ok(byte) => bytes.push(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && !bytes.is_empty() => break,
            Err(e) => return Err(malformed("string")(e)),
        }
    }
    String::from_utf8(bytes)
        .map_err(|e| RelayError::ProtocolError(format!("Invalid UTF-8 in string: {}", e)))
}

/// Error 패킷
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrorPacket {
    /// Error 패킷이 아니면 None
    pub fn parse(data: &[u8]) -> Option<Self> {
        if !is_error_packet(data) || data.len() < 3 {
            return None;
        }
        let code = u16::from_le_bytes([data[1], data[2]]);
        let rest = &data[3..];
        let (sql_state, message) = if rest.len() >= 6 && rest[0] == b'#' {
            (String::from_utf8_lossy(&rest[1..6]).into_owned(), &rest[6..])
        } else {
            (String::new(), rest)
        };
        Some(ErrorPacket {
            code,
            sql_state,
            message: String::from_utf8_lossy(message).into_owned(),
        })
    }
}

impl std::fmt::Display for ErrorPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sql_state.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] ({}) {}", self.code, self.sql_state, self.message)
        }
    }
}

pub fn is_error_packet(data: &[u8]) -> bool {
    data.first() == Some(&ERROR_PACKET)
}

pub fn is_ok_packet(data: &[u8]) -> bool {
    data.first() == Some(&OK_PACKET)
}

/// 스트림 종료를 알리는 EOF 패킷
pub fn is_eof_packet(data: &[u8]) -> bool {
    data.first() == Some(&EOF_PACKET) && data.len() < 9
}

/// COM_QUERY 명령
pub fn query_command(query: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(query.len() + 1);
    buffer.push(COM_QUERY);
    buffer.extend_from_slice(query.as_bytes());
    buffer
}

/// COM_BINLOG_DUMP 명령. 위치는 `@slave_connect_state`가 정하므로 파일 이름은 비운다
pub fn binlog_dump_command(server_id: u32, binlog_filename: &str, binlog_position: u32) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    WriteBytesExt::write_u8(&mut buffer, COM_BINLOG_DUMP)?;
    WriteBytesExt::write_u32::<LittleEndian>(&mut buffer, binlog_position)?;
    WriteBytesExt::write_u16::<LittleEndian>(&mut buffer, BINLOG_SEND_ANNOTATE_ROWS_EVENT)?;
    WriteBytesExt::write_u32::<LittleEndian>(&mut buffer, server_id)?;
    Write::write_all(&mut buffer, binlog_filename.as_bytes())?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::greeting_bytes;

    #[test]
    fn test_parse_greeting() {
        let scramble: [u8; 20] = core::array::from_fn(|i| i as u8 + 1);
        let greeting = GreetingPacket::parse(&greeting_bytes(&scramble)).unwrap();

        assert_eq!(greeting.protocol_version, 10);
        assert_eq!(greeting.server_version, "10.6.12-MariaDB");
        assert_eq!(greeting.thread_id, 42);
        assert_eq!(greeting.scramble, scramble.to_vec());
        assert_eq!(greeting.auth_plugin, "mysql_native_password");
    }

    #[test]
    fn test_greeting_error_is_protocol_error() {
        let mut data = vec![0xFF];
        data.extend_from_slice(&1040u16.to_le_bytes());
        data.extend_from_slice(b"Too many connections");
        assert!(matches!(GreetingPacket::parse(&data), Err(RelayError::ProtocolError(_))));
    }

    #[test]
    fn test_parse_error_packet() {
        let mut data = vec![0xFF];
        data.extend_from_slice(&1236u16.to_le_bytes());
        data.extend_from_slice(b"#HY000Could not find GTID state");
        let err = ErrorPacket::parse(&data).unwrap();

        assert_eq!(err.code, 1236);
        assert_eq!(err.sql_state, "HY000");
        assert_eq!(err.message, "Could not find GTID state");
        assert_eq!(err.to_string(), "[1236] (HY000) Could not find GTID state");
        assert!(ErrorPacket::parse(&[0x00, 0x00]).is_none());
    }

    #[test]
    fn test_packet_kinds() {
        assert!(is_error_packet(&[0xFF, 0x01, 0x02]));
        assert!(!is_error_packet(&[]));
        assert!(is_ok_packet(&[0x00, 0x01, 0x02]));
        assert!(is_eof_packet(&[0xFE, 0, 0, 2, 0]));
        assert!(!is_eof_packet(&[0xFE; 20]));
    }

    #[test]
    fn test_binlog_dump_command() {
        let cmd = binlog_dump_command(1234, "", 4).unwrap();
        assert_eq!(cmd.len(), 11);
        assert_eq!(cmd[0], COM_BINLOG_DUMP);
        assert_eq!(&cmd[1..5], &4u32.to_le_bytes());
        assert_eq!(&cmd[5..7], &BINLOG_SEND_ANNOTATE_ROWS_EVENT.to_le_bytes());
        assert_eq!(&cmd[7..11], &1234u32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_sequence_numbers() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = PacketChannel::new(client);
        let mut server = PacketChannel::new(server);

        server.write_command(b"hello").await.unwrap();
        assert_eq!(client.read_packet().await.unwrap(), b"hello");

        // 응답은 다음 sequence
        client.write_packet(b"reply").await.unwrap();
        let mut raw = [0u8; 4];
        server.stream.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [5, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_reassembles_max_length_packets() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut client = PacketChannel::new(client);
        let mut server = PacketChannel::new(server);

        let payload: Vec<u8> = (0..MAX_PACKET_LENGTH + 10).map(|i| i as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            server.write_command(&payload).await.unwrap();
            server.write_command(&vec![7u8; MAX_PACKET_LENGTH]).await.unwrap();
        });

        assert_eq!(client.read_packet().await.unwrap(), expected);
        // 정확히 최대 길이인 패킷 뒤에는 빈 패킷이 붙는다
        assert_eq!(client.read_packet().await.unwrap().len(), MAX_PACKET_LENGTH);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream_is_connection_loss() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = PacketChannel::new(client);
        drop(server);
        assert!(matches!(client.read_packet().await, Err(RelayError::ConnectionLost(_))));
    }
}
