//! The dispatcher: turns a parsed [`Command`] into a [`Reply`], mutating the store and the
//! replication state as a side effect. One dispatch call handles exactly one command from
//! an ordinary client connection; commands arriving over the replication stream from a
//! leader are applied directly by [`crate::replication::follower`] and never pass through
//! here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::parser::command::{replconf_getack, Block, Command, ReplConfCommand, XreadStart};
use crate::parser::resp::Value;
use crate::replication::rdb::{get_empty_rdb, serialize_rdb};
use crate::storage::kv::StoreError;
use crate::storage::stream::{Field, IdSpec, RangeBound, StreamEntry, StreamId};

use super::data::{current_millis, LiveData, Server};
use super::metadata::ReplicaInfo;

/// What the connection loop should do with a dispatch result.
pub enum Reply {
    /// An ordinary reply, written back to the connection that sent the command.
    ToClient(Value),
    /// Raw bytes (a simple-string `FULLRESYNC` line followed by a snapshot frame) after
    /// which the connection should be promoted to a replica connection.
    HandshakeComplete(Vec<u8>),
    /// No reply is sent (e.g. a REPLCONF variant only meaningful on the other role).
    Drop,
}

pub async fn dispatch(command: Command, server: Arc<Server>, _peer: SocketAddr) -> Reply {
    match command {
        Command::Ping => Reply::ToClient(Value::simple("PONG")),
        Command::Echo(data) => Reply::ToClient(Value::bulk(data)),
        Command::Get(key) => handle_get(&server, &key),
        Command::Set { key, value, px } => handle_set(&server, key, value, px),
        Command::Info(section) => handle_info(&server, &section),
        Command::ReplConf(ReplConfCommand::ListeningPort(_) | ReplConfCommand::Capa(_)) => {
            Reply::ToClient(Value::simple("OK"))
        }
        Command::ReplConf(_) => Reply::Drop,
        Command::Psync => handle_psync(&server),
        Command::Wait {
            replica_count,
            timeout_ms,
        } => handle_wait(&server, replica_count, timeout_ms).await,
        Command::ConfigGet(key) => handle_config_get(&server, &key),
        Command::Keys(pattern) => handle_keys(&server, &pattern),
        Command::Type(key) => handle_type(&server, &key),
        Command::Xadd {
            key,
            id_spec,
            fields,
        } => handle_xadd(&server, key, id_spec, fields),
        Command::Xrange { key, start, end } => handle_xrange(&server, &key, start, end),
        Command::Xread {
            keys,
            starts,
            block,
        } => handle_xread(server.clone(), keys, starts, block).await,
    }
}

fn error_reply(e: impl std::fmt::Display) -> Reply {
    Reply::ToClient(Value::error(e.to_string()))
}

fn handle_get(server: &Server, key: &[u8]) -> Reply {
    match server.store.lock().unwrap().get(key) {
        Ok(Some(value)) => Reply::ToClient(Value::bulk(value)),
        Ok(None) => Reply::ToClient(Value::NullBulk),
        Err(e) => error_reply(e),
    }
}

fn handle_set(server: &Server, key: Vec<u8>, value: Vec<u8>, px: Option<u64>) -> Reply {
    let expire_at = px.map(|ms| Instant::now() + Duration::from_millis(ms));
    let result = server.store.lock().unwrap().set(&key, &value, expire_at);
    match result {
        Ok(()) => {
            if server.is_master() {
                server.propagate(&Command::Set { key, value, px });
            }
            Reply::ToClient(Value::simple("OK"))
        }
        Err(e) => error_reply(e),
    }
}

fn handle_info(server: &Server, section: &[u8]) -> Reply {
    if section.eq_ignore_ascii_case(b"replication") {
        let payload = server.metadata.get_replica_info(server.replication_offset());
        Reply::ToClient(Value::bulk(payload))
    } else {
        error_reply(format!(
            "ERR unsupported INFO section {:?}",
            String::from_utf8_lossy(section)
        ))
    }
}

fn handle_psync(server: &Server) -> Reply {
    if !server.is_master() {
        return error_reply("ERR PSYNC is only supported on a leader");
    }
    let ReplicaInfo::Master(info) = &server.metadata.replica_info else {
        unreachable!("is_master() already confirmed this");
    };
    let offset = server.replication_offset();
    let mut bytes = Value::simple(format!("FULLRESYNC {} {}", info.replication_id, offset)).encode();
    bytes.extend_from_slice(&serialize_rdb(&get_empty_rdb()));
    Reply::HandshakeComplete(bytes)
}

async fn handle_wait(server: &Arc<Server>, replica_count: usize, timeout_ms: u64) -> Reply {
    if !server.is_master() {
        return error_reply("ERR WAIT is only supported on a leader");
    }
    if replica_count == 0 {
        return Reply::ToClient(Value::Integer(0));
    }

    let getack_payload = replconf_getack().encode();
    let (already_caught_up, targets, ack_notify) = {
        let mut live = server.live_data.lock().unwrap();
        match &mut *live {
            LiveData::Master(m) => {
                let (caught_up, targets) = m.replica_manager.send_getack(&getack_payload);
                (caught_up, targets, m.replica_manager.ack_notify.clone())
            }
            LiveData::Slave(_) => unreachable!("is_master() already confirmed this"),
        }
    };

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let acked = {
            let live = server.live_data.lock().unwrap();
            match &*live {
                LiveData::Master(m) => m.replica_manager.count_caught_up(&targets),
                LiveData::Slave(_) => 0,
            }
        };
        let total = (already_caught_up + acked).min(replica_count);
        if total >= replica_count {
            return Reply::ToClient(Value::Integer(total as i64));
        }

        let now = Instant::now();
        if now >= deadline {
            return Reply::ToClient(Value::Integer(total as i64));
        }

        tokio::select! {
            _ = ack_notify.notified() => {}
            _ = tokio::time::sleep(deadline - now) => {}
        }
    }
}

fn handle_config_get(server: &Server, key: &[u8]) -> Reply {
    let name = String::from_utf8_lossy(key).to_lowercase();
    let value = match (name.as_str(), &server.metadata.rdb_config) {
        ("dir", Some(cfg)) => cfg.dir.clone().into_bytes(),
        ("dbfilename", Some(cfg)) => cfg.dbfilename.clone().into_bytes(),
        _ => Vec::new(),
    };
    Reply::ToClient(Value::array(vec![Value::bulk(key.to_vec()), Value::bulk(value)]))
}

fn handle_keys(server: &Server, pattern: &[u8]) -> Reply {
    if pattern != b"*" {
        return error_reply("ERR KEYS only supports the literal * pattern");
    }
    let keys = server.store.lock().unwrap().keys_all();
    Reply::ToClient(Value::bulk_array(keys))
}

fn handle_type(server: &Server, key: &[u8]) -> Reply {
    Reply::ToClient(Value::simple(server.store.lock().unwrap().type_of(key)))
}

fn handle_xadd(server: &Server, key: Vec<u8>, id_spec: IdSpec, fields: Vec<Field>) -> Reply {
    let now_ms = current_millis();
    let result = server
        .store
        .lock()
        .unwrap()
        .xadd_and_notify(&key, &id_spec, fields.clone(), now_ms);
    match result {
        Ok(id) => {
            if server.is_master() {
                // Propagate with the already-resolved ID, not the original spec ("*" or
                // "ms-*"), so the follower's independent clock never produces a different
                // ID than the leader assigned.
                let resolved = Command::Xadd {
                    key: key.clone(),
                    id_spec: IdSpec::Explicit(id),
                    fields,
                };
                server.propagate(&resolved);
            }
            Reply::ToClient(Value::bulk(id.to_string()))
        }
        Err(e) => error_reply(e),
    }
}

fn handle_xrange(server: &Server, key: &[u8], start: RangeBound, end: RangeBound) -> Reply {
    match server.store.lock().unwrap().xrange(key, start, end) {
        Ok(entries) => Reply::ToClient(Value::array(entries.iter().map(entry_to_value))),
        Err(e) => error_reply(e),
    }
}

fn entry_to_value(entry: &StreamEntry) -> Value {
    let mut fields = Vec::with_capacity(entry.fields.len() * 2);
    for (name, value) in &entry.fields {
        fields.push(Value::bulk(name.clone()));
        fields.push(Value::bulk(value.clone()));
    }
    Value::array(vec![Value::bulk(entry.id.to_string()), Value::Array(fields)])
}

fn resolve_starts(
    server: &Server,
    keys: &[Vec<u8>],
    starts: &[XreadStart],
) -> Result<Vec<StreamId>, StoreError> {
    let mut store = server.store.lock().unwrap();
    keys.iter()
        .zip(starts.iter())
        .map(|(key, start)| match start {
            XreadStart::Id(id) => Ok(*id),
            XreadStart::Last => store.stream_top(key),
        })
        .collect()
}

type XreadSnapshot = Vec<(Vec<u8>, Vec<StreamEntry>)>;

fn read_snapshot(
    server: &Server,
    keys: &[Vec<u8>],
    starts: &[StreamId],
) -> Result<XreadSnapshot, StoreError> {
    let mut store = server.store.lock().unwrap();
    let mut out = Vec::new();
    for (key, start) in keys.iter().zip(starts.iter()) {
        let entries = store.xread_snapshot(key, *start)?;
        if !entries.is_empty() {
            out.push((key.clone(), entries));
        }
    }
    Ok(out)
}

fn build_xread_reply(streams: XreadSnapshot) -> Reply {
    if streams.is_empty() {
        return Reply::ToClient(Value::NullArray);
    }
    let value = Value::array(streams.into_iter().map(|(key, entries)| {
        Value::array(vec![
            Value::bulk(key),
            Value::array(entries.iter().map(entry_to_value)),
        ])
    }));
    Reply::ToClient(value)
}

/// Suspend until any one of `notifiers` fires, then return. Dropping the `JoinSet` aborts
/// whichever per-key waits didn't win.
async fn wait_for_any(notifiers: Vec<Arc<Notify>>) {
    let mut set = JoinSet::new();
    for notify in notifiers {
        set.spawn(async move {
            notify.notified().await;
        });
    }
    set.join_next().await;
}

async fn handle_xread(
    server: Arc<Server>,
    keys: Vec<Vec<u8>>,
    starts: Vec<XreadStart>,
    block: Option<Block>,
) -> Reply {
    let resolved = match resolve_starts(&server, &keys, &starts) {
        Ok(r) => r,
        Err(e) => return error_reply(e),
    };

    match read_snapshot(&server, &keys, &resolved) {
        Ok(streams) if !streams.is_empty() => return build_xread_reply(streams),
        Ok(_) => {}
        Err(e) => return error_reply(e),
    }

    let Some(block) = block else {
        return Reply::ToClient(Value::NullArray);
    };

    let deadline = match block {
        Block::Indefinite => None,
        Block::Millis(ms) => Some(Instant::now() + Duration::from_millis(ms)),
    };

    loop {
        let notifiers: Vec<Arc<Notify>> = {
            let mut store = server.store.lock().unwrap();
            keys.iter().map(|k| store.notifier_for(k)).collect()
        };

        let woke = match deadline {
            None => {
                wait_for_any(notifiers).await;
                true
            }
            Some(dl) => {
                let now = Instant::now();
                if now >= dl {
                    return Reply::ToClient(Value::NullArray);
                }
                tokio::time::timeout(dl - now, wait_for_any(notifiers)).await.is_ok()
            }
        };
        if !woke {
            return Reply::ToClient(Value::NullArray);
        }

        match read_snapshot(&server, &keys, &resolved) {
            Ok(streams) if !streams.is_empty() => return build_xread_reply(streams),
            Ok(_) => continue,
            Err(e) => return error_reply(e),
        }
    }
}
