//! Per-connection task bodies. Every accepted connection starts in the ordinary client
//! loop; a `PSYNC` promotes it into the dual read/write loop a replica connection needs
//! (reading inbound `REPLCONF ACK`s while writing propagated commands).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::network::connection::{read_value_from, write_raw_to, Connection};
use crate::parser::command::{parse_command, Command, CommandError, ReplConfCommand};
use crate::parser::resp::Value;
use crate::{log_debug, log_error, log_info};

use super::data::Server;
use super::handler::{dispatch, Reply};

pub async fn handle_client(stream: TcpStream, server: Arc<Server>) {
    let peer = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            log_error!("failed to read peer address on accept: {}", e);
            return;
        }
    };
    log_info!("accepted connection from {}", peer);
    let mut conn = Connection::new(stream);

    loop {
        let (value, _len) = match conn.read_value().await {
            Ok(Some(pair)) => pair,
            Ok(None) => break,
            Err(e) => {
                log_error!("connection {} closed on error: {}", peer, e);
                break;
            }
        };

        let command = match parse_command(&value) {
            Ok(command) => command,
            Err(CommandError::UnknownCommand(name)) => {
                log_debug!("dropping unknown command {:?} from {}", name, peer);
                continue;
            }
            Err(e) => {
                log_debug!("rejecting invalid command from {}: {}", peer, e);
                let reply = Value::error(format!("ERR {}", e));
                if let Err(e) = conn.write_value(&reply).await {
                    log_error!("failed to write reply to {}: {}", peer, e);
                    break;
                }
                continue;
            }
        };

        match dispatch(command, server.clone(), peer).await {
            Reply::ToClient(reply) => {
                if let Err(e) = conn.write_value(&reply).await {
                    log_error!("failed to write reply to {}: {}", peer, e);
                    break;
                }
            }
            Reply::Drop => {}
            Reply::HandshakeComplete(bytes) => {
                if let Err(e) = conn.write_raw(&bytes).await {
                    log_error!("failed to complete PSYNC handshake with {}: {}", peer, e);
                    break;
                }
                run_replica_connection(conn, peer, server).await;
                return;
            }
        }
    }
}

/// A promoted connection: one task draining the outbound propagation channel into the
/// socket's write half, this task reading inbound `REPLCONF ACK`s off the read half.
async fn run_replica_connection(conn: Connection, peer: SocketAddr, server: Arc<Server>) {
    let (mut read_half, mut buffer, mut write_half) = conn.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    server.add_replica(peer, tx);

    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if write_raw_to(&mut write_half, &payload).await.is_err() {
                break;
            }
        }
    });

    loop {
        match read_value_from(&mut read_half, &mut buffer).await {
            Ok(Some((value, _))) => {
                if let Ok(Command::ReplConf(ReplConfCommand::Ack(offset))) = parse_command(&value) {
                    server.record_replica_ack(peer, offset);
                }
            }
            Ok(None) => break,
            Err(e) => {
                log_error!("replica {} connection error: {}", peer, e);
                break;
            }
        }
    }

    writer.abort();
    server.remove_replica(peer);
}
