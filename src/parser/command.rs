//! Turns a decoded [`Value`] array into a typed [`Command`]. Argument walking is
//! deliberately linear — each command knows exactly how many arguments it expects and in
//! what order, matching the recognized-command table.

use crate::storage::stream::{Field, IdSpec, RangeBound, StreamError, StreamId};

use super::resp::{ParseError, Value};
use super::resp::Result as RespResult;

/// A failure turning a decoded [`Value`] array into a [`Command`]. Distinguishes a verb the
/// server has never heard of from a recognized verb used wrong, since callers reply
/// differently to each: the former is dropped silently, the latter gets an `-ERR` back.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("{0}")]
    Invalid(#[from] ParseError),
    #[error("{0}")]
    Stream(#[from] StreamError),
}

type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplConfCommand {
    ListeningPort(u16),
    Capa(String),
    GetAck,
    Ack(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Indefinite,
    Millis(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XreadStart {
    Id(StreamId),
    /// `$` — resolved against the stream's current top at dispatch time.
    Last,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Echo(Vec<u8>),
    Get(Vec<u8>),
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
        px: Option<u64>,
    },
    Info(Vec<u8>),
    ReplConf(ReplConfCommand),
    Psync,
    Wait {
        replica_count: usize,
        timeout_ms: u64,
    },
    ConfigGet(Vec<u8>),
    Keys(Vec<u8>),
    Type(Vec<u8>),
    Xadd {
        key: Vec<u8>,
        id_spec: IdSpec,
        fields: Vec<Field>,
    },
    Xrange {
        key: Vec<u8>,
        start: RangeBound,
        end: RangeBound,
    },
    Xread {
        keys: Vec<Vec<u8>>,
        starts: Vec<XreadStart>,
        block: Option<Block>,
    },
}

fn as_str(value: &Value) -> RespResult<&str> {
    std::str::from_utf8(value.as_bulk()?).map_err(|e| ParseError::Invalid(e.to_string()))
}

fn parse_u64(value: &Value) -> RespResult<u64> {
    as_str(value)?
        .parse()
        .map_err(|_| ParseError::Invalid("expected an unsigned integer".to_string()))
}

struct Args<'a> {
    items: std::slice::Iter<'a, Value>,
}

impl<'a> Args<'a> {
    fn next(&mut self) -> RespResult<&'a Value> {
        self.items
            .next()
            .ok_or_else(|| ParseError::Invalid("wrong number of arguments".to_string()))
    }

    fn next_bulk(&mut self) -> RespResult<Vec<u8>> {
        Ok(self.next()?.as_bulk()?.to_vec())
    }

    fn next_str(&mut self) -> RespResult<String> {
        Ok(as_str(self.next()?)?.to_string())
    }

    fn finished(&mut self) -> bool {
        self.items.as_slice().is_empty()
    }
}

fn parse_set(args: &mut Args) -> Result<Command> {
    let key = args.next_bulk()?;
    let value = args.next_bulk()?;
    let px = if args.finished() {
        None
    } else {
        let flag = args.next_str()?;
        if !flag.eq_ignore_ascii_case("px") {
            return Err(ParseError::Invalid(format!("unsupported SET flag {:?}", flag)).into());
        }
        Some(parse_u64(args.next()?)?)
    };
    Ok(Command::Set { key, value, px })
}

fn parse_replconf(args: &mut Args) -> Result<Command> {
    let sub = args.next_str()?;
    let cmd = match sub.to_lowercase().as_str() {
        "listening-port" => ReplConfCommand::ListeningPort(
            parse_u64(args.next()?)?
                .try_into()
                .map_err(|_| ParseError::Invalid("listening-port out of range".to_string()))?,
        ),
        "capa" => ReplConfCommand::Capa(args.next_str()?),
        "getack" => {
            let _wildcard = args.next_str()?;
            ReplConfCommand::GetAck
        }
        "ack" => ReplConfCommand::Ack(parse_u64(args.next()?)?),
        other => {
            return Err(ParseError::Invalid(format!("unknown REPLCONF subcommand {:?}", other)).into())
        }
    };
    Ok(Command::ReplConf(cmd))
}

fn parse_wait(args: &mut Args) -> Result<Command> {
    let replica_count = parse_u64(args.next()?)? as usize;
    let timeout_ms = parse_u64(args.next()?)?;
    Ok(Command::Wait {
        replica_count,
        timeout_ms,
    })
}

fn parse_config(args: &mut Args) -> Result<Command> {
    let sub = args.next_str()?;
    if !sub.eq_ignore_ascii_case("get") {
        return Err(ParseError::Invalid(format!("unsupported CONFIG subcommand {:?}", sub)).into());
    }
    Ok(Command::ConfigGet(args.next_bulk()?))
}

fn parse_xadd(args: &mut Args) -> Result<Command> {
    let key = args.next_bulk()?;
    let id_spec = IdSpec::parse(&args.next_str()?)?;
    let mut fields = Vec::new();
    loop {
        if args.finished() {
            break;
        }
        let field = args.next_bulk()?;
        let value = args.next_bulk()?;
        fields.push((field, value));
    }
    Ok(Command::Xadd {
        key,
        id_spec,
        fields,
    })
}

fn parse_xrange(args: &mut Args) -> Result<Command> {
    let key = args.next_bulk()?;
    let start = RangeBound::parse_start(&args.next_str()?)?;
    let end = RangeBound::parse_end(&args.next_str()?)?;
    Ok(Command::Xrange { key, start, end })
}

fn parse_xread(args: &mut Args) -> Result<Command> {
    let mut block = None;
    let mut token = args.next_str()?;
    if token.eq_ignore_ascii_case("block") {
        let ms = parse_u64(args.next()?)?;
        block = Some(if ms == 0 { Block::Indefinite } else { Block::Millis(ms) });
        token = args.next_str()?;
    }
    if !token.eq_ignore_ascii_case("streams") {
        return Err(ParseError::Invalid(format!("expected STREAMS, got {:?}", token)).into());
    }
    let remaining: Vec<&Value> = args.items.as_slice().iter().collect();
    if remaining.len() % 2 != 0 || remaining.is_empty() {
        return Err(ParseError::Invalid(
            "XREAD requires an equal number of stream keys and IDs".to_string(),
        )
        .into());
    }
    let half = remaining.len() / 2;
    let keys = remaining[..half]
        .iter()
        .map(|v| v.as_bulk().map(|b| b.to_vec()))
        .collect::<RespResult<Vec<_>>>()?;
    let starts = remaining[half..]
        .iter()
        .map(|v| -> Result<XreadStart> {
            let text = as_str(v)?;
            if text == "$" {
                Ok(XreadStart::Last)
            } else {
                Ok(XreadStart::Id(StreamId::parse(text)?))
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Command::Xread { keys, starts, block })
}

/// Parse a fully decoded command array (as produced by [`super::resp::decode`]) into a
/// [`Command`]. The caller is responsible for having already sliced a single message out of
/// the decode stream.
pub fn parse_command(value: &Value) -> Result<Command> {
    let items = value.as_array()?;
    let mut iter = items.iter();
    let name = iter
        .next()
        .ok_or_else(|| ParseError::Invalid("empty command array".to_string()))?;
    let name = as_str(name)?.to_lowercase();
    let mut args = Args { items: iter };
    match name.as_str() {
        "ping" => Ok(Command::Ping),
        "echo" => Ok(Command::Echo(args.next_bulk()?)),
        "get" => Ok(Command::Get(args.next_bulk()?)),
        "set" => parse_set(&mut args),
        "info" => Ok(Command::Info(args.next_bulk()?)),
        "replconf" => parse_replconf(&mut args),
        "psync" => Ok(Command::Psync),
        "wait" => parse_wait(&mut args),
        "config" => parse_config(&mut args),
        "keys" => Ok(Command::Keys(args.next_bulk()?)),
        "type" => Ok(Command::Type(args.next_bulk()?)),
        "xadd" => parse_xadd(&mut args),
        "xrange" => parse_xrange(&mut args),
        "xread" => parse_xread(&mut args),
        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

impl Command {
    /// Re-encode a write command exactly as it should be propagated to replicas.
    pub fn to_wire(&self) -> Value {
        match self {
            Command::Set { key, value, px } => {
                let mut parts: Vec<Vec<u8>> = vec![b"SET".to_vec(), key.clone(), value.clone()];
                if let Some(px) = px {
                    parts.push(b"PX".to_vec());
                    parts.push(px.to_string().into_bytes());
                }
                Value::bulk_array(parts)
            }
            Command::Xadd {
                key,
                id_spec,
                fields,
            } => {
                let mut parts: Vec<Vec<u8>> = vec![b"XADD".to_vec(), key.clone()];
                parts.push(id_spec_to_wire(id_spec).into_bytes());
                for (field, value) in fields {
                    parts.push(field.clone());
                    parts.push(value.clone());
                }
                Value::bulk_array(parts)
            }
            other => panic!("{:?} is not a propagated write command", other),
        }
    }
}

fn id_spec_to_wire(spec: &IdSpec) -> String {
    match spec {
        IdSpec::Explicit(id) => id.to_string(),
        IdSpec::AutoSeq(ms) => format!("{}-*", ms),
        IdSpec::AutoBoth => "*".to_string(),
    }
}

pub fn replconf_getack() -> Value {
    Value::bulk_array(vec![b"REPLCONF".to_vec(), b"GETACK".to_vec(), b"*".to_vec()])
}

pub fn replconf_ack(offset: u64) -> Value {
    Value::bulk_array(vec![
        b"REPLCONF".to_vec(),
        b"ACK".to_vec(),
        offset.to_string().into_bytes(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_value(parts: &[&[u8]]) -> Value {
        Value::bulk_array(parts.iter().map(|p| p.to_vec()).collect::<Vec<_>>())
    }

    #[test]
    fn parses_ping() {
        let value = command_value(&[b"PING"]);
        assert_eq!(parse_command(&value).unwrap(), Command::Ping);
    }

    #[test]
    fn parses_set_with_px() {
        let value = command_value(&[b"SET", b"foo", b"bar", b"PX", b"100"]);
        assert_eq!(
            parse_command(&value).unwrap(),
            Command::Set {
                key: b"foo".to_vec(),
                value: b"bar".to_vec(),
                px: Some(100),
            }
        );
    }

    #[test]
    fn parses_xadd_with_fields() {
        let value = command_value(&[b"XADD", b"s", b"5-*", b"field1", b"v1"]);
        let parsed = parse_command(&value).unwrap();
        assert_eq!(
            parsed,
            Command::Xadd {
                key: b"s".to_vec(),
                id_spec: IdSpec::AutoSeq(5),
                fields: vec![(b"field1".to_vec(), b"v1".to_vec())],
            }
        );
    }

    #[test]
    fn parses_xread_block_streams() {
        let value = command_value(&[b"XREAD", b"BLOCK", b"500", b"STREAMS", b"s", b"$"]);
        assert_eq!(
            parse_command(&value).unwrap(),
            Command::Xread {
                keys: vec![b"s".to_vec()],
                starts: vec![XreadStart::Last],
                block: Some(Block::Millis(500)),
            }
        );
    }

    #[test]
    fn parses_wait() {
        let value = command_value(&[b"WAIT", b"1", b"1000"]);
        assert_eq!(
            parse_command(&value).unwrap(),
            Command::Wait {
                replica_count: 1,
                timeout_ms: 1000,
            }
        );
    }

    #[test]
    fn unknown_command_is_an_error() {
        let value = command_value(&[b"FROBNICATE"]);
        assert!(matches!(parse_command(&value), Err(CommandError::UnknownCommand(_))));
    }

    #[test]
    fn bad_arguments_on_a_known_command_is_distinguished_from_unknown() {
        let value = command_value(&[b"SET", b"foo"]);
        assert!(matches!(parse_command(&value), Err(CommandError::Invalid(_))));
    }
}
