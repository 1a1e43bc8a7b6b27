use crate::riverpool::Result;
use crate::riverpool::config::Settings;
use crate::riverpool::pg::backend_set::BackendSet;
use crate::riverpool::pg::protocol::{framer, Message, MessageBuilder, ProtocolVersion, Tag};
use crate::riverpool::pg::stream::PoolStream;

/// Type oid of text, used for every column of the status result
const TEXT_OID: i32 = 25;

const COLUMNS: [&str; 3] = ["item", "value", "description"];

/// One row of SHOW pool_status
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StatusRow {
    pub item: String,
    pub value: String,
    pub description: String,
}

impl StatusRow {
    fn new<V: ToString, D: ToString>(item: &str, value: V, description: D) -> Self {
        Self{item: item.to_string(), value: value.to_string(), description: description.to_string()}
    }

    fn values(&self) -> [&str; 3] {
        [&self.item, &self.value, &self.description]
    }
}

fn flag(b: bool) -> u8 {
    b as u8
}

/// pool_status lists the running configuration and the status of every backend
pub fn pool_status(settings: &Settings, backends: &BackendSet) -> Vec<StatusRow> {
    let mut rows = vec![
        StatusRow::new("listen_addresses", &settings.host, "host name(s) or IP address(es) to listen to"),
        StatusRow::new("port", settings.port, "pgpool accepting port number"),
        StatusRow::new("num_workers", settings.num_workers, "number of worker threads"),
        StatusRow::new("max_connections", settings.max_connections, "maximum number of concurrent sessions"),
        StatusRow::new("connect_timeout", settings.connect_timeout_seconds, "backend connect timeout in seconds"),
        StatusRow::new("client_idle_limit", settings.client_idle_limit, "idle time in seconds to disconnect a client"),
        StatusRow::new("client_idle_limit_in_recovery", settings.client_idle_limit_in_recovery,
            "idle time in seconds to disconnect a client in recovery"),
        StatusRow::new("reset_query_list", settings.reset_query_list.join(";"), "queries issued at the end of a session"),
        StatusRow::new("replication_mode", flag(settings.replication_mode), "non 0 if operating in replication mode"),
        StatusRow::new("replication_stop_on_mismatch", flag(settings.replication_stop_on_mismatch),
            "stop replication mode on fatal error"),
        StatusRow::new("load_balance_mode", flag(settings.load_balance_mode), "non 0 if operating in load balancing mode"),
        StatusRow::new("parallel_mode", flag(settings.parallel_mode), "if non 0, run in parallel query mode"),
        StatusRow::new("ignore_leading_white_space", flag(settings.ignore_leading_white_space),
            "ignore leading white spaces"),
        StatusRow::new("log_statement", flag(settings.log_statement), "if non 0, logs all SQL statements"),
        StatusRow::new("log_per_node_statement", flag(settings.log_per_node_statement),
            "if non 0, logs all SQL statements on each node"),
        StatusRow::new("relcache_size", settings.relcache_size, "number of relation cache entries"),
    ];

    let status = backends.status();
    for (i, backend) in settings.backends.iter().enumerate() {
        rows.push(StatusRow::new(&format!("backend_hostname{}", i), &backend.host, format!("backend #{} hostname", i)));
        rows.push(StatusRow::new(&format!("backend_port{}", i), backend.port, format!("backend #{} port number", i)));
        rows.push(StatusRow::new(&format!("backend_weight{}", i), backend.weight, format!("weight of backend #{}", i)));
        rows.push(StatusRow::new(&format!("backend_status{}", i), status.get(i), format!("status of backend #{}", i)));
    }
    rows
}

fn row_description(protocol: ProtocolVersion) -> Message {
    let mut mb = MessageBuilder::new(Tag::ROW_DESCRIPTION);
    mb.write_i16(COLUMNS.len() as i16);
    for name in COLUMNS.iter() {
        mb.write_str(name);
        if protocol == ProtocolVersion::V3 {
            mb.write_i32(0).write_i16(0);
        }
        mb.write_i32(TEXT_OID).write_i16(-1).write_i32(-1);
        if protocol == ProtocolVersion::V3 {
            mb.write_i16(0);
        }
    }
    mb.finish()
}

fn data_row(protocol: ProtocolVersion, values: &[&str]) -> Message {
    let mut mb = MessageBuilder::new(Tag::DATA_ROW);
    match protocol {
        ProtocolVersion::V3 => {
            mb.write_i16(values.len() as i16);
            for value in values {
                mb.write_i32(value.len() as i32).write_bytes(value.as_bytes());
            }
        },
        ProtocolVersion::V2 => {
            // every column is non-null: a bitmap of all ones, then sizes that include themselves
            let bitmap_len = (values.len() + 7) / 8;
            for i in 0..bitmap_len {
                let remaining = values.len() - i * 8;
                let byte = if remaining >= 8 { 0xff } else { !(0xffu8 >> remaining) };
                mb.write_byte(byte);
            }
            for value in values {
                mb.write_i32(value.len() as i32 + 4).write_bytes(value.as_bytes());
            }
        },
    }
    mb.finish()
}

/// send_rows writes the status result to the client, followed by ReadyForQuery with tstate
pub async fn send_rows(frontend: &mut PoolStream, rows: &[StatusRow], tstate: u8) -> Result<()> {
    let protocol = frontend.protocol;
    framer::write_message(frontend, &row_description(protocol))?;
    for row in rows {
        framer::write_message(frontend, &data_row(protocol, &row.values()))?;
    }
    let mut mb = MessageBuilder::new(Tag::COMMAND_COMPLETE);
    mb.write_str("SHOW");
    framer::write_message(frontend, &mb.finish())?;
    let mut mb = MessageBuilder::new(Tag::READY_FOR_QUERY);
    if protocol == ProtocolVersion::V3 {
        mb.write_byte(tstate);
    }
    framer::encode_and_send(frontend, &mb.finish()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::riverpool::pg::protocol::RowDescription;

    #[test]
    fn test_row_description_parses_in_both_versions() {
        for &protocol in &[ProtocolVersion::V3, ProtocolVersion::V2] {
            let desc = RowDescription::parse(&row_description(protocol), protocol).unwrap();
            assert_eq!(desc.len(), 3);
            assert_eq!(desc.get(1).unwrap().name, "value");
            assert_eq!(desc.get(2).unwrap().type_oid, TEXT_OID);
        }
    }

    #[test]
    fn test_legacy_data_row_bitmap() {
        let msg = data_row(ProtocolVersion::V2, &["a", "bc", "d"]);
        assert_eq!(msg.body()[0], 0b1110_0000);
        assert_eq!(&msg.body()[1..6], &[0, 0, 0, 5, b'a']);
    }

    #[test]
    fn test_v3_data_row() {
        let msg = data_row(ProtocolVersion::V3, &["x", ""]);
        assert_eq!(msg.body(), &[0, 2, 0, 0, 0, 1, b'x', 0, 0, 0, 0]);
    }
}
