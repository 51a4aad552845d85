//! The catch-up protocol.
//!
//! A member whose log has been pruned past its position cannot be served
//! by log shipping; it pulls a store copy, a transaction tail, and if
//! necessary a core snapshot from an up-to-date member, then resumes
//! normal replication.

pub mod client;
pub mod server;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::ProtocolViolation;
use crate::marshal;
use crate::marshal::MarshalResult;
use crate::operation::EntryPayload;
use crate::operation::LogEntry;
use crate::storage::CoreSnapshot;
use crate::LogId;
use crate::StoreId;

/// Wire tags of the catch-up messages.
pub mod tag {
    pub const GET_STORE_ID: u8 = 0x20;
    pub const PREPARE_STORE_COPY: u8 = 0x21;
    pub const FILE_HEADER: u8 = 0x22;
    pub const FILE_CHUNK: u8 = 0x23;
    pub const STORE_COPY_FINISHED: u8 = 0x24;
    pub const TX_PULL_REQUEST: u8 = 0x25;
    pub const TX_PULL_RESPONSE: u8 = 0x26;
    pub const TX_STREAM_FINISHED: u8 = 0x27;
    pub const CORE_SNAPSHOT: u8 = 0x28;
}

/// Terminal status of a catch-up stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatchupStatus {
    /// The stream completed; the client holds everything requested.
    SuccessEndOfStream,
    /// The requested transactions were pruned; a snapshot is required.
    TransactionPruned,
    /// The stores do not match. Fatal.
    StoreIdMismatch,
    /// A recoverable server-side failure; the client retries.
    GeneralError,
}

impl CatchupStatus {
    pub fn marshal(&self, buf: &mut impl BufMut) {
        let code: u8 = match self {
            CatchupStatus::SuccessEndOfStream => 0,
            CatchupStatus::TransactionPruned => 1,
            CatchupStatus::StoreIdMismatch => 2,
            CatchupStatus::GeneralError => 3,
        };
        buf.put_u8(code);
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        Ok(match marshal::get_u8(buf)? {
            0 => CatchupStatus::SuccessEndOfStream,
            1 => CatchupStatus::TransactionPruned,
            2 => CatchupStatus::StoreIdMismatch,
            3 => CatchupStatus::GeneralError,
            _ => return Err(ProtocolViolation::Malformed("invalid catch-up status")),
        })
    }
}

/// One store file in a copy listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreFileInfo {
    pub name: String,
    pub length: u64,
}

/// Requests sent by the catch-up client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatchupRequest {
    GetStoreId,
    PrepareStoreCopy,
    GetFile { name: String },
    TxPull { previous_tx_id: u64, store_id: StoreId },
    CoreSnapshot,
}

impl CatchupRequest {
    pub fn wire_tag(&self) -> u8 {
        match self {
            CatchupRequest::GetStoreId => tag::GET_STORE_ID,
            CatchupRequest::PrepareStoreCopy => tag::PREPARE_STORE_COPY,
            CatchupRequest::GetFile { .. } => tag::FILE_HEADER,
            CatchupRequest::TxPull { .. } => tag::TX_PULL_REQUEST,
            CatchupRequest::CoreSnapshot => tag::CORE_SNAPSHOT,
        }
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        match self {
            CatchupRequest::GetStoreId | CatchupRequest::PrepareStoreCopy | CatchupRequest::CoreSnapshot => {}
            CatchupRequest::GetFile { name } => marshal::put_string(buf, name),
            CatchupRequest::TxPull {
                previous_tx_id,
                store_id,
            } => {
                buf.put_u64(*previous_tx_id);
                marshal::put_store_id(buf, *store_id);
            }
        }
    }

    pub fn unmarshal(wire_tag: u8, buf: &mut impl Buf) -> MarshalResult<Self> {
        Ok(match wire_tag {
            tag::GET_STORE_ID => CatchupRequest::GetStoreId,
            tag::PREPARE_STORE_COPY => CatchupRequest::PrepareStoreCopy,
            tag::FILE_HEADER => CatchupRequest::GetFile {
                name: marshal::get_string(buf)?,
            },
            tag::TX_PULL_REQUEST => CatchupRequest::TxPull {
                previous_tx_id: marshal::get_u64(buf)?,
                store_id: marshal::get_store_id(buf)?,
            },
            tag::CORE_SNAPSHOT => CatchupRequest::CoreSnapshot,
            other => return Err(ProtocolViolation::UnknownTag(other)),
        })
    }
}

/// Responses streamed by the catch-up server.
#[derive(Clone, Debug, PartialEq)]
pub enum CatchupResponse {
    StoreId(StoreId),
    PrepareStoreCopy {
        files: Vec<StoreFileInfo>,
        last_tx_id: u64,
    },
    FileHeader {
        name: String,
        required_alignment: u32,
    },
    FileChunk {
        bytes: Bytes,
    },
    StoreCopyFinished {
        status: CatchupStatus,
    },
    TxPull {
        entry: LogEntry,
    },
    TxStreamFinished {
        status: CatchupStatus,
        last_tx_id: u64,
    },
    CoreSnapshot {
        snapshot: CoreSnapshot,
    },
}

impl CatchupResponse {
    pub fn wire_tag(&self) -> u8 {
        match self {
            CatchupResponse::StoreId(_) => tag::GET_STORE_ID,
            CatchupResponse::PrepareStoreCopy { .. } => tag::PREPARE_STORE_COPY,
            CatchupResponse::FileHeader { .. } => tag::FILE_HEADER,
            CatchupResponse::FileChunk { .. } => tag::FILE_CHUNK,
            CatchupResponse::StoreCopyFinished { .. } => tag::STORE_COPY_FINISHED,
            CatchupResponse::TxPull { .. } => tag::TX_PULL_RESPONSE,
            CatchupResponse::TxStreamFinished { .. } => tag::TX_STREAM_FINISHED,
            CatchupResponse::CoreSnapshot { .. } => tag::CORE_SNAPSHOT,
        }
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        match self {
            CatchupResponse::StoreId(store_id) => marshal::put_store_id(buf, *store_id),
            CatchupResponse::PrepareStoreCopy { files, last_tx_id } => {
                buf.put_u32(files.len() as u32);
                for file in files {
                    marshal::put_string(buf, &file.name);
                    buf.put_u64(file.length);
                }
                buf.put_u64(*last_tx_id);
            }
            CatchupResponse::FileHeader {
                name,
                required_alignment,
            } => {
                marshal::put_string(buf, name);
                buf.put_u32(*required_alignment);
            }
            CatchupResponse::FileChunk { bytes } => marshal::put_bytes(buf, bytes),
            CatchupResponse::StoreCopyFinished { status } => status.marshal(buf),
            CatchupResponse::TxPull { entry } => {
                buf.put_u64(entry.log_id.term);
                buf.put_u64(entry.log_id.index);
                marshal::put_bytes(buf, &entry.payload.marshal_to_bytes());
            }
            CatchupResponse::TxStreamFinished { status, last_tx_id } => {
                status.marshal(buf);
                buf.put_u64(*last_tx_id);
            }
            CatchupResponse::CoreSnapshot { snapshot } => snapshot.marshal(buf),
        }
    }

    pub fn unmarshal(wire_tag: u8, buf: &mut impl Buf) -> MarshalResult<Self> {
        Ok(match wire_tag {
            tag::GET_STORE_ID => CatchupResponse::StoreId(marshal::get_store_id(buf)?),
            tag::PREPARE_STORE_COPY => {
                let n = marshal::get_u32(buf)?;
                let mut files = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    files.push(StoreFileInfo {
                        name: marshal::get_string(buf)?,
                        length: marshal::get_u64(buf)?,
                    });
                }
                CatchupResponse::PrepareStoreCopy {
                    files,
                    last_tx_id: marshal::get_u64(buf)?,
                }
            }
            tag::FILE_HEADER => CatchupResponse::FileHeader {
                name: marshal::get_string(buf)?,
                required_alignment: marshal::get_u32(buf)?,
            },
            tag::FILE_CHUNK => CatchupResponse::FileChunk {
                bytes: marshal::get_bytes(buf)?,
            },
            tag::STORE_COPY_FINISHED => CatchupResponse::StoreCopyFinished {
                status: CatchupStatus::unmarshal(buf)?,
            },
            tag::TX_PULL_RESPONSE => {
                let term = marshal::get_u64(buf)?;
                let index = marshal::get_u64(buf)?;
                let content = marshal::get_bytes(buf)?;
                CatchupResponse::TxPull {
                    entry: LogEntry {
                        log_id: LogId::new(term, index),
                        payload: EntryPayload::unmarshal_from_bytes(content)?,
                    },
                }
            }
            tag::TX_STREAM_FINISHED => CatchupResponse::TxStreamFinished {
                status: CatchupStatus::unmarshal(buf)?,
                last_tx_id: marshal::get_u64(buf)?,
            },
            tag::CORE_SNAPSHOT => CatchupResponse::CoreSnapshot {
                snapshot: CoreSnapshot::unmarshal(buf)?,
            },
            other => return Err(ProtocolViolation::UnknownTag(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn round_trip_request(request: CatchupRequest) {
        let mut buf = BytesMut::new();
        request.marshal(&mut buf);
        let decoded = CatchupRequest::unmarshal(request.wire_tag(), &mut buf.freeze()).unwrap();
        assert_eq!(decoded, request);
    }

    fn round_trip_response(response: CatchupResponse) {
        let mut buf = BytesMut::new();
        response.marshal(&mut buf);
        let decoded = CatchupResponse::unmarshal(response.wire_tag(), &mut buf.freeze()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn requests_round_trip() {
        round_trip_request(CatchupRequest::GetStoreId);
        round_trip_request(CatchupRequest::GetFile {
            name: "id-allocation".into(),
        });
        round_trip_request(CatchupRequest::TxPull {
            previous_tx_id: 42,
            store_id: StoreId::from_u128(7),
        });
    }

    #[test]
    fn responses_round_trip() {
        round_trip_response(CatchupResponse::StoreId(StoreId::from_u128(9)));
        round_trip_response(CatchupResponse::PrepareStoreCopy {
            files: vec![StoreFileInfo {
                name: "session-tracker".into(),
                length: 512,
            }],
            last_tx_id: 40,
        });
        round_trip_response(CatchupResponse::FileHeader {
            name: "lock-token".into(),
            required_alignment: 1,
        });
        round_trip_response(CatchupResponse::TxStreamFinished {
            status: CatchupStatus::TransactionPruned,
            last_tx_id: 0,
        });
        round_trip_response(CatchupResponse::TxPull {
            entry: LogEntry {
                log_id: LogId::new(2, 17),
                payload: EntryPayload::Blank,
            },
        });
    }

    #[test]
    fn status_codes_are_stable() {
        for status in [
            CatchupStatus::SuccessEndOfStream,
            CatchupStatus::TransactionPruned,
            CatchupStatus::StoreIdMismatch,
            CatchupStatus::GeneralError,
        ] {
            let mut buf = BytesMut::new();
            status.marshal(&mut buf);
            assert_eq!(CatchupStatus::unmarshal(&mut buf.freeze()).unwrap(), status);
        }
    }
}
