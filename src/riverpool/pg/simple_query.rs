use bytes::Bytes;
use tracing::{debug, info};

use crate::riverpool::{Error, Result};
use crate::riverpool::pg::protocol::{ErrorFields, Message, MessageBuilder, ProtocolVersion, Tag, framer};
use crate::riverpool::pg::stream::{PoolStream, TSTATE_ERROR, TSTATE_IDLE, TSTATE_IN_TRANSACTION};

/// The outcome of a statement the proxy ran on its own behalf on one backend.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub command_tag: String,
    pub rows: Vec<Vec<Option<Bytes>>>,
    pub error: Option<ErrorFields>,
}

impl QueryResult {
    /// first_value returns the first column of the first row, if any
    pub fn first_value(&self) -> Option<&[u8]> {
        self.rows.first().and_then(|r| r.first()).and_then(|v| v.as_deref())
    }
}

/// query_message builds a simple Query message for the given text
pub fn query_message(query: &str) -> Message {
    let mut mb = MessageBuilder::new(Tag::QUERY);
    mb.write_str(query);
    mb.finish()
}

/// update_legacy_tstate tracks the transaction state of a V2 connection, which has no
/// status byte in ReadyForQuery, from the command tags and errors it returns.
pub fn update_legacy_tstate(stream: &mut PoolStream, msg: &Message) {
    if !stream.protocol.is_legacy() {
        return;
    }
    match msg.tag() {
        Tag::COMMAND_COMPLETE => {
            if let Ok(tag) = msg.first_str() {
                if tag.starts_with("BEGIN") {
                    stream.tstate = TSTATE_IN_TRANSACTION;
                } else if tag.starts_with("COMMIT") || tag.starts_with("ROLLBACK") {
                    stream.tstate = TSTATE_IDLE;
                }
            }
        },
        Tag::ERROR_RESPONSE if stream.tstate == TSTATE_IN_TRANSACTION => stream.tstate = TSTATE_ERROR,
        _ => (),
    }
}

/// parse_data_row decodes a DataRow into its column values
pub fn parse_data_row(msg: &Message, version: ProtocolVersion, num_fields: usize) -> Result<Vec<Option<Bytes>>> {
    let body = msg.body_bytes();
    let r = msg.reader();
    let mut values = Vec::new();
    match version {
        ProtocolVersion::V3 => {
            let n = r.read_i16();
            for _ in 0..n {
                let len = r.read_i32();
                if len < 0 {
                    values.push(None);
                } else {
                    let start = r.tell() as usize;
                    r.read_bytes(len as u32)?;
                    values.push(Some(body.slice(start..start + len as usize)));
                }
            }
        },
        ProtocolVersion::V2 => {
            let bitmap = r.read_bytes(((num_fields + 7) / 8) as u32)?;
            for i in 0..num_fields {
                if bitmap[i / 8] & (0x80 >> (i % 8)) == 0 {
                    values.push(None);
                    continue;
                }
                let len = r.read_i32() - 4;
                let start = r.tell() as usize;
                r.read_bytes(len.max(0) as u32)?;
                values.push(Some(body.slice(start..start + len.max(0) as usize)));
            }
        },
    }
    r.error()?;
    Ok(values)
}

/// do_query sends query to one backend and collects its response up to ReadyForQuery.
/// Errors returned by the backend are reported in QueryResult::error, not as Err.
pub async fn do_query(stream: &mut PoolStream, query: &str) -> Result<QueryResult> {
    debug!(peer = ?stream.peer, query, "do_query");
    framer::encode_and_send(stream, &query_message(query)).await?;
    let mut result = QueryResult::default();
    loop {
        let msg = framer::read_message(stream).await?;
        update_legacy_tstate(stream, &msg);
        match msg.tag() {
            Tag::ROW_DESCRIPTION | Tag::EMPTY_QUERY | Tag::NOTIFICATION_RESPONSE => (),
            Tag::DATA_ROW => {
                let row = parse_data_row(&msg, stream.protocol, stream.row_fields)?;
                result.rows.push(row);
            },
            Tag::COMMAND_COMPLETE => result.command_tag = msg.first_str()?.to_string(),
            Tag::ERROR_RESPONSE => result.error = Some(ErrorFields::parse(&msg, stream.protocol)?),
            Tag::NOTICE_RESPONSE => {
                let notice = ErrorFields::parse(&msg, stream.protocol)?;
                info!(peer = ?stream.peer, query, notice = notice.message(), "notice from backend");
            },
            Tag::PARAMETER_STATUS if !stream.protocol.is_legacy() => {
                let r = msg.reader();
                let name = r.read_str()?.to_string();
                let value = r.read_str()?.to_string();
                stream.params.set(name, value);
            },
            Tag::READY_FOR_QUERY => {
                if !stream.protocol.is_legacy() {
                    if let Some(&state) = msg.body().first() {
                        stream.tstate = state;
                    }
                }
                return Ok(result);
            },
            Tag::COPY_IN_RESPONSE | Tag::COPY_OUT_RESPONSE => {
                return Err(Error::protocol_error(format!("unexpected copy response to internal query {}", query)));
            },
            tag => {
                return Err(Error::protocol_error(format!("unexpected {} in response to internal query {}", tag, query)));
            }
        }
    }
}

/// do_command runs a statement whose result is only success or failure.
pub async fn do_command(stream: &mut PoolStream, query: &str) -> Result<()> {
    let result = do_query(stream, query).await?;
    match result.error {
        Some(err) => Err(Error::new(format!("{} failed on {:?}: {}", query, stream.peer, err.message()))),
        None => Ok(()),
    }
}
