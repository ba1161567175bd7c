//! The follower side of replication: the startup handshake with the leader, followed by
//! the long-lived command-processing loop over that same connection.
//!
//! The handshake is retried from scratch, bounded by an overall deadline, whenever a step
//! times out. Once the handshake completes, a dropped leader connection ends the command
//! loop and `run` returns — reconnecting a live replication stream is out of scope.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::network::connection::{Connection, ConnectionError};
use crate::parser::command::{parse_command, replconf_ack, Command, ReplConfCommand};
use crate::parser::resp::Value;
use crate::server::data::Server;
use crate::{log_debug, log_error, log_info, log_warn};

const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_OVERALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("unexpected reply from leader: {0}")]
    UnexpectedReply(String),
    #[error("leader closed the connection during the handshake")]
    ClosedDuringHandshake,
    #[error("handshake step timed out")]
    TimedOut,
    #[error("handshake did not complete within the overall deadline")]
    OverallTimedOut,
}

type Result<T> = std::result::Result<T, HandshakeError>;

pub async fn run(master_host: String, master_port: u16, listening_port: u16, server: Arc<Server>) {
    log_info!("connecting to leader at {}:{}", master_host, master_port);
    match perform(&master_host, master_port, listening_port, server).await {
        Ok(()) => log_info!("replication connection to leader closed"),
        Err(e) => log_error!(
            "replication with leader {}:{} failed: {}",
            master_host,
            master_port,
            e
        ),
    }
}

/// Runs the handshake, retrying from `PING` whenever a step times out, until either it
/// succeeds or the overall deadline elapses. Any non-timeout handshake failure (connection
/// refused, an unexpected reply) is returned immediately rather than retried.
async fn perform(
    master_host: &str,
    master_port: u16,
    listening_port: u16,
    server: Arc<Server>,
) -> Result<()> {
    let deadline = Instant::now() + HANDSHAKE_OVERALL_TIMEOUT;
    loop {
        match handshake(master_host, master_port, listening_port).await {
            Ok(conn) => {
                log_info!("handshake complete, entering replication stream");
                return command_loop(conn, server).await;
            }
            Err(HandshakeError::TimedOut) => {
                if Instant::now() >= deadline {
                    return Err(HandshakeError::OverallTimedOut);
                }
                log_warn!(
                    "handshake step with leader {}:{} timed out, retrying from scratch",
                    master_host,
                    master_port
                );
            }
            Err(e) => return Err(e),
        }
    }
}

async fn handshake(master_host: &str, master_port: u16, listening_port: u16) -> Result<Connection> {
    let stream = TcpStream::connect((master_host, master_port)).await?;
    let mut conn = Connection::new(stream);

    send(&mut conn, Value::bulk_array(vec![b"PING".to_vec()])).await?;
    expect_simple(&mut conn, "pong").await?;

    send(
        &mut conn,
        Value::bulk_array(vec![
            b"REPLCONF".to_vec(),
            b"listening-port".to_vec(),
            listening_port.to_string().into_bytes(),
        ]),
    )
    .await?;
    expect_simple(&mut conn, "ok").await?;

    send(
        &mut conn,
        Value::bulk_array(vec![b"REPLCONF".to_vec(), b"capa".to_vec(), b"psync2".to_vec()]),
    )
    .await?;
    expect_simple(&mut conn, "ok").await?;

    send(
        &mut conn,
        Value::bulk_array(vec![b"PSYNC".to_vec(), b"?".to_vec(), b"-1".to_vec()]),
    )
    .await?;
    let fullresync = read_value(&mut conn).await?;
    match &fullresync {
        Value::Simple(s) if s.to_lowercase().starts_with("fullresync") => {}
        other => return Err(HandshakeError::UnexpectedReply(format!("{:?}", other))),
    }

    let snapshot = timeout(HANDSHAKE_STEP_TIMEOUT, conn.read_raw_frame())
        .await
        .map_err(|_| HandshakeError::TimedOut)??;
    log_debug!("received {} byte snapshot from leader", snapshot.len());

    Ok(conn)
}

async fn send(conn: &mut Connection, value: Value) -> Result<()> {
    timeout(HANDSHAKE_STEP_TIMEOUT, conn.write_value(&value))
        .await
        .map_err(|_| HandshakeError::TimedOut)??;
    Ok(())
}

async fn read_value(conn: &mut Connection) -> Result<Value> {
    match timeout(HANDSHAKE_STEP_TIMEOUT, conn.read_value())
        .await
        .map_err(|_| HandshakeError::TimedOut)??
    {
        Some((value, _)) => Ok(value),
        None => Err(HandshakeError::ClosedDuringHandshake),
    }
}

async fn expect_simple(conn: &mut Connection, expected: &str) -> Result<()> {
    match read_value(conn).await? {
        Value::Simple(s) if s.eq_ignore_ascii_case(expected) => Ok(()),
        other => Err(HandshakeError::UnexpectedReply(format!("{:?}", other))),
    }
}

/// The only connection this follower ever treats as its leader; a GETACK arriving on any
/// other connection simply never reaches this loop, so the peer-identity check the spec
/// calls for holds structurally rather than needing a runtime address comparison.
async fn command_loop(mut conn: Connection, server: Arc<Server>) -> Result<()> {
    let mut processed_from_master: u64 = 0;
    loop {
        let (value, len) = match conn.read_value().await? {
            Some(pair) => pair,
            None => return Ok(()),
        };
        let len = len as u64;

        match parse_command(&value) {
            Ok(command @ (Command::Set { .. } | Command::Xadd { .. })) => {
                server.apply_replicated_write(&command);
            }
            Ok(Command::ReplConf(ReplConfCommand::GetAck)) => {
                let reply = replconf_ack(processed_from_master);
                conn.write_value(&reply).await?;
            }
            Ok(Command::Ping) => {}
            Ok(other) => log_debug!("follower ignoring command from leader: {:?}", other),
            Err(e) => log_warn!("dropping unparseable command from leader: {}", e),
        }

        processed_from_master += len;
        server.set_follower_offset(processed_from_master);
    }
}
