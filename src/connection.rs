//! 업스트림 복제 연결
//!
//! Writer는 `Connection` 트레이트만 알고, 실제 MariaDB 마스터와의 통신은
//! `MariaDbConnection`이 맡는다.

use crate::auth;
use crate::config::ConnectionConfig;
use crate::error::{RelayError, Result};
use crate::events::RplEvent;
use crate::gtid::GtidList;
use crate::protocol::{self, ErrorPacket, GreetingPacket, PacketChannel};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// 복제 이벤트 공급원
#[allow(async_fn_in_trait)]
pub trait Connection {
    /// `gtid_list` 다음 트랜잭션부터 스트리밍 시작. 기존 연결은 닫고 새로 맺는다
    async fn start_replication(&mut self, server_id: u32, gtid_list: &GtidList) -> Result<()>;

    /// 다음 이벤트. 연결이 끊기면 `ConnectionLost`
    async fn get_rpl_msg(&mut self) -> Result<RplEvent>;

    async fn ping(&mut self) -> Result<()>;

    /// 마지막 에러 설명
    fn error_string(&self) -> String;
}

/// MariaDB 마스터와의 GTID 기반 복제 연결
pub struct MariaDbConnection {
    config: ConnectionConfig,
    channel: Option<PacketChannel>,
    streaming: bool,
    last_error: String,
}

impl MariaDbConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        MariaDbConnection {
            config,
            channel: None,
            streaming: false,
            last_error: String::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    async fn connect(&mut self) -> Result<PacketChannel> {
        let address = self.config.address();
        let mut channel = tokio::time::timeout(self.config.timeout, PacketChannel::<TcpStream>::connect(&address))
            .await
            .map_err(|_| RelayError::ConnectionLost(format!("Timed out connecting to {}", address)))??;

        let greeting = authenticate(&mut channel, &self.config.username, &self.config.password).await?;
        info!(
            "Connected to {}, server version: {}, thread id: {}",
            address, greeting.server_version, greeting.thread_id
        );
        Ok(channel)
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = e.to_string();
            if !matches!(e, RelayError::ProtocolError(_)) {
                self.channel = None;
                self.streaming = false;
            }
        }
        result
    }
}

impl Connection for MariaDbConnection {
    async fn start_replication(&mut self, server_id: u32, gtid_list: &GtidList) -> Result<()> {
        self.channel = None;
        self.streaming = false;

        let result = async {
            let mut channel = self.connect().await?;
            register_replica(&mut channel, server_id, gtid_list).await?;
            Ok(channel)
        }
        .await;

        let channel = self.record(result)?;
        info!("Replication started from '{}' as server id {}", gtid_list, server_id);
        self.channel = Some(channel);
        self.streaming = true;
        Ok(())
    }

    async fn get_rpl_msg(&mut self) -> Result<RplEvent> {
        let result = match self.channel.as_mut() {
            Some(channel) => read_event(channel).await,
            None => Err(RelayError::ConnectionLost("Not connected".to_string())),
        };
        self.record(result)
    }

    async fn ping(&mut self) -> Result<()> {
        if self.streaming {
            // 덤프 중인 연결에는 명령을 보낼 수 없다. 수신 중이면 살아 있는 것
            return Ok(());
        }
        let result = match self.channel.as_mut() {
            Some(channel) => ping(channel).await,
            None => Err(RelayError::ConnectionLost("Not connected".to_string())),
        };
        self.record(result)
    }

    fn error_string(&self) -> String {
        self.last_error.clone()
    }
}

/// greeting 수신과 native password 인증
async fn authenticate<S>(channel: &mut PacketChannel<S>, username: &str, password: &str) -> Result<GreetingPacket>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = GreetingPacket::parse(&channel.read_packet().await?)?;
    if !greeting.auth_plugin.is_empty() && greeting.auth_plugin != auth::NATIVE_PASSWORD_PLUGIN {
        debug!("Server default auth plugin is {}, answering with native password", greeting.auth_plugin);
    }

    let response = auth::handshake_response(username, password, &greeting.scramble)?;
    channel.write_packet(&response).await?;

    let reply = channel.read_packet().await?;
    if let Some(err) = ErrorPacket::parse(&reply) {
        return Err(RelayError::ProtocolError(format!("Authentication failed: {}", err)));
    }
    if reply.first() == Some(&protocol::EOF_PACKET) {
        return Err(RelayError::ProtocolError(
            "Authentication method switch is not supported".to_string(),
        ));
    }
    if !protocol::is_ok_packet(&reply) {
        return Err(RelayError::ProtocolError("Unexpected authentication reply".to_string()));
    }

    debug!("Authentication successful");
    Ok(greeting)
}

/// 세션 변수를 설정하고 COM_BINLOG_DUMP를 보낸다
async fn register_replica<S>(channel: &mut PacketChannel<S>, server_id: u32, gtid_list: &GtidList) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let queries = [
        "SET @master_binlog_checksum='NONE'".to_string(),
        "SET @mariadb_slave_capability=4".to_string(),
        format!("SET @slave_connect_state='{}'", gtid_list),
        "SET @slave_gtid_strict_mode=1".to_string(),
        "SET @slave_gtid_ignore_duplicates=1".to_string(),
        "SET NAMES latin1".to_string(),
    ];
    for query in &queries {
        execute(channel, query).await?;
    }

    let dump = protocol::binlog_dump_command(server_id, "", 4)?;
    channel.write_command(&dump).await?;
    debug!("Sent COM_BINLOG_DUMP as server id {}", server_id);
    Ok(())
}

/// OK 응답을 기대하는 쿼리
async fn execute<S>(channel: &mut PacketChannel<S>, query: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel.write_command(&protocol::query_command(query)).await?;
    let reply = channel.read_packet().await?;
    if let Some(err) = ErrorPacket::parse(&reply) {
        return Err(RelayError::ProtocolError(format!("Query '{}' failed: {}", query, err)));
    }
    if !protocol::is_ok_packet(&reply) {
        return Err(RelayError::ProtocolError(format!("Query '{}' returned a result set", query)));
    }
    debug!("Executed: {}", query);
    Ok(())
}

async fn read_event<S>(channel: &mut PacketChannel<S>) -> Result<RplEvent>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let packet = channel.read_packet().await?;

    if let Some(err) = ErrorPacket::parse(&packet) {
        return Err(RelayError::ProtocolError(format!("Replication error: {}", err)));
    }
    if protocol::is_eof_packet(&packet) {
        warn!("Upstream ended the binlog stream");
        return Err(RelayError::ConnectionLost("Upstream ended the binlog stream".to_string()));
    }
    if !protocol::is_ok_packet(&packet) {
        return Err(RelayError::ProtocolError(format!(
            "Unexpected packet type 0x{:02x} in binlog stream",
            packet.first().copied().unwrap_or_default()
        )));
    }

    RplEvent::from_raw(packet[1..].to_vec())
        .map_err(|e| RelayError::ProtocolError(format!("Malformed event from upstream: {}", e)))
}

async fn ping<S>(channel: &mut PacketChannel<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel.write_command(&[protocol::COM_PING]).await?;
    let reply = channel.read_packet().await?;
    if protocol::is_ok_packet(&reply) {
        Ok(())
    } else {
        Err(RelayError::ProtocolError("Unexpected reply to COM_PING".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::test_util::{greeting_bytes, gtid_event};
    use tokio::io::DuplexStream;
    use tokio_test::{assert_err, assert_ok};

    const OK: &[u8] = &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];

    fn error_packet(code: u16, message: &str) -> Vec<u8> {
        let mut data = vec![0xFF];
        data.extend_from_slice(&code.to_le_bytes());
        data.extend_from_slice(b"#HY000");
        data.extend_from_slice(message.as_bytes());
        data
    }

    fn pair() -> (PacketChannel<DuplexStream>, PacketChannel<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (PacketChannel::new(client), PacketChannel::new(server))
    }

    #[tokio::test]
    async fn test_authenticate() {
        let (mut client, mut server) = pair();
        let scramble = [7u8; 20];

        let master = tokio::spawn(async move {
            server.write_command(&greeting_bytes(&scramble)).await.unwrap();
            let response = server.read_packet().await.unwrap();
            server.write_packet(OK).await.unwrap();
            response
        });

        let greeting = assert_ok!(authenticate(&mut client, "repl", "secret").await);
        assert_eq!(greeting.server_version, "10.6.12-MariaDB");

        let response = master.await.unwrap();
        assert_eq!(response, auth::handshake_response("repl", "secret", &scramble).unwrap());
    }

    #[tokio::test]
    async fn test_authentication_failure_is_protocol_error() {
        let (mut client, mut server) = pair();

        tokio::spawn(async move {
            server.write_command(&greeting_bytes(&[1u8; 20])).await.unwrap();
            server.read_packet().await.unwrap();
            server
                .write_packet(&error_packet(1045, "Access denied for user 'repl'"))
                .await
                .unwrap();
        });

        let err = assert_err!(authenticate(&mut client, "repl", "wrong").await);
        assert!(matches!(err, RelayError::ProtocolError(_)));
        assert!(err.to_string().contains("Access denied"));
    }

    #[tokio::test]
    async fn test_auth_switch_is_rejected() {
        let (mut client, mut server) = pair();

        tokio::spawn(async move {
            server.write_command(&greeting_bytes(&[1u8; 20])).await.unwrap();
            server.read_packet().await.unwrap();
            let mut switch = vec![0xFE];
            switch.extend_from_slice(b"client_ed25519\0");
            server.write_packet(&switch).await.unwrap();
        });

        let err = assert_err!(authenticate(&mut client, "repl", "secret").await);
        assert!(matches!(err, RelayError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_register_replica_sends_session_setup() {
        let (mut client, mut server) = pair();
        let list: GtidList = "0-1-100,1-2-7".parse().unwrap();

        let master = tokio::spawn(async move {
            let mut queries = Vec::new();
            for _ in 0..6 {
                let packet = server.read_packet().await.unwrap();
                assert_eq!(packet[0], protocol::COM_QUERY);
                queries.push(String::from_utf8(packet[1..].to_vec()).unwrap());
                server.write_packet(OK).await.unwrap();
            }
            let dump = server.read_packet().await.unwrap();
            (queries, dump)
        });

        assert_ok!(register_replica(&mut client, 1234, &list).await);

        let (queries, dump) = master.await.unwrap();
        assert_eq!(queries[0], "SET @master_binlog_checksum='NONE'");
        assert!(queries.contains(&"SET @slave_connect_state='0-1-100,1-2-7'".to_string()));
        assert!(queries.contains(&"SET @slave_gtid_strict_mode=1".to_string()));
        assert_eq!(dump, protocol::binlog_dump_command(1234, "", 4).unwrap());
    }

    #[tokio::test]
    async fn test_rejected_query_is_protocol_error() {
        let (mut client, mut server) = pair();

        tokio::spawn(async move {
            server.read_packet().await.unwrap();
            server.write_packet(&error_packet(1193, "Unknown system variable")).await.unwrap();
        });

        let err = assert_err!(register_replica(&mut client, 1, &GtidList::new()).await);
        assert!(matches!(err, RelayError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_read_events() {
        let (mut client, mut server) = pair();
        let event = gtid_event(0, 1, 5);
        let raw = event.raw().to_vec();

        tokio::spawn(async move {
            let mut packet = vec![0x00];
            packet.extend_from_slice(&raw);
            server.write_command(&packet).await.unwrap();
            server.write_command(&error_packet(1236, "Could not find GTID state")).await.unwrap();
            server.write_command(&[0xFE, 0, 0, 2, 0]).await.unwrap();
        });

        let received = assert_ok!(read_event(&mut client).await);
        assert_eq!(received.event_type(), EventType::GtidEvent);
        assert_eq!(received.raw(), event.raw());

        let err = assert_err!(read_event(&mut client).await);
        assert!(matches!(err, RelayError::ProtocolError(_)));

        let err = assert_err!(read_event(&mut client).await);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_ping() {
        let (mut client, mut server) = pair();

        tokio::spawn(async move {
            let packet = server.read_packet().await.unwrap();
            assert_eq!(packet, vec![protocol::COM_PING]);
            server.write_packet(OK).await.unwrap();
        });

        assert_ok!(ping(&mut client).await);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = ConnectionConfig::new("127.0.0.1", "repl");
        config.port = port;
        let mut conn = MariaDbConnection::new(config);

        let err = assert_err!(conn.start_replication(1, &GtidList::new()).await);
        assert!(err.is_transient());
        assert!(!conn.error_string().is_empty());
        assert!(!conn.is_connected());

        let err = assert_err!(conn.get_rpl_msg().await);
        assert!(err.is_transient());
    }
}
