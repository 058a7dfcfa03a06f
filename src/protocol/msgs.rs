use serde::Deserialize;
use serde::Serialize;

use crate::config_models::TableInfo;
use crate::errors::PsResult;

/// Every message exchanged between name node, server threads and bg workers.
///
/// Row and oplog payloads are raw byte layouts: see [`crate::oplog::bg_oplog`]
/// for oplog batches and [`crate::server::server_table::RowsPayload`] for
/// replied and pushed rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::Display)]
pub enum PsMsg {
    /// Bg worker → name node and server threads of its channel.
    ClientConnect { client_id: i32 },

    /// Server thread → name node.
    ServerConnect,

    /// Name node / server thread → bg worker, once every peer is connected.
    ClientStart,

    CreateTable {
        table_id: i32,
        table_info: TableInfo,
    },
    CreateTableReply { table_id: i32 },

    /// Name node → head bg workers, once every configured table exists.
    CreatedAllTables,

    /// `clock` is the oldest server clock the requester accepts.
    RowRequest {
        table_id: i32,
        row_id: i32,
        clock: i32,
    },
    RowRequestReply {
        table_id: i32,
        row_id: i32,
        clock: i32,

        /// Last oplog version of the requesting bg worker applied to the row.
        version: i32,
        row_data: Vec<u8>,
    },

    ClientSendOpLog {
        seq: u64,
        is_clock: bool,
        clock: i32,
        version: i32,
        oplog: Vec<u8>,
    },
    ServerOpLogAck { ack_seq: u64, version: i32 },

    ServerPushRow {
        version: i32,
        seq: u64,
        is_clock: bool,
        clock: i32,
        rows: Vec<u8>,
    },
    BgPushRowAck { ack_seq: u64 },

    ClientShutDown,
    ServerShutDownAck,
}

impl PsMsg {
    pub fn encode(&self) -> PsResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> PsResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PsError;

    #[test]
    fn display_names_the_variant() {
        assert_eq!("ClientShutDown", PsMsg::ClientShutDown.to_string());
        assert_eq!(
            "RowRequest",
            PsMsg::RowRequest {
                table_id: 0,
                row_id: 1,
                clock: 2
            }
            .to_string()
        );
    }

    #[test]
    fn encoded_push_decodes() {
        let msg = PsMsg::ServerPushRow {
            version: 3,
            seq: 9,
            is_clock: true,
            clock: 4,
            rows: vec![1, 2, 3],
        };
        assert_eq!(msg, PsMsg::decode(&msg.encode().unwrap()).unwrap());
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(
            PsMsg::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]),
            Err(PsError::Codec(_))
        ));
    }
}
