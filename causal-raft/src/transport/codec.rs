//! Wire framing and handshake messages.
//!
//! Every frame is `[length: u32][tag: u8][body]`. Before any other
//! traffic a channel negotiates its protocol version: the connecting side
//! sends `Hello` listing what it supports, the accepting side answers
//! `Switchover` with the chosen version. After switchover, every message
//! body begins with the sender's cluster id (the full 128-bit id) so the
//! receiver can reject cross-cluster traffic.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::error::ProtocolViolation;
use crate::marshal;
use crate::marshal::MarshalResult;
use crate::message::RaftMessage;
use crate::ClusterId;
use crate::MemberId;

/// Handshake tags.
pub const TAG_HELLO: u8 = 0x10;
pub const TAG_SWITCHOVER: u8 = 0x11;

/// Protocol versions this build speaks.
pub const SUPPORTED_APP_VERSIONS: &[u32] = &[1];

/// Largest accepted frame. Oversized frames close the channel.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// The connecting side's version offer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub supported_app_versions: Vec<u32>,
    pub supported_modifiers: Vec<u32>,
}

impl Hello {
    pub fn current() -> Self {
        Self {
            supported_app_versions: SUPPORTED_APP_VERSIONS.to_vec(),
            supported_modifiers: Vec::new(),
        }
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u32(self.supported_app_versions.len() as u32);
        for v in &self.supported_app_versions {
            buf.put_u32(*v);
        }
        buf.put_u32(self.supported_modifiers.len() as u32);
        for m in &self.supported_modifiers {
            buf.put_u32(*m);
        }
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        let n = marshal::get_u32(buf)?;
        let mut supported_app_versions = Vec::with_capacity(n as usize);
        for _ in 0..n {
            supported_app_versions.push(marshal::get_u32(buf)?);
        }
        let m = marshal::get_u32(buf)?;
        let mut supported_modifiers = Vec::with_capacity(m as usize);
        for _ in 0..m {
            supported_modifiers.push(marshal::get_u32(buf)?);
        }
        Ok(Self {
            supported_app_versions,
            supported_modifiers,
        })
    }
}

/// The accepting side's version choice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Switchover {
    pub chosen_app_version: u32,
    pub chosen_modifiers: Vec<u32>,
}

impl Switchover {
    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u32(self.chosen_app_version);
        buf.put_u32(self.chosen_modifiers.len() as u32);
        for m in &self.chosen_modifiers {
            buf.put_u32(*m);
        }
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        let chosen_app_version = marshal::get_u32(buf)?;
        let n = marshal::get_u32(buf)?;
        let mut chosen_modifiers = Vec::with_capacity(n as usize);
        for _ in 0..n {
            chosen_modifiers.push(marshal::get_u32(buf)?);
        }
        Ok(Self {
            chosen_app_version,
            chosen_modifiers,
        })
    }
}

/// Pick the highest version both sides speak.
pub fn choose_version(offered: &[u32]) -> Option<u32> {
    offered
        .iter()
        .filter(|v| SUPPORTED_APP_VERSIONS.contains(v))
        .max()
        .copied()
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    tag: u8,
    body: &[u8],
) -> std::io::Result<()> {
    let mut header = BytesMut::with_capacity(5);
    header.put_u32(body.len() as u32 + 1);
    header.put_u8(tag);
    writer.write_all(&header).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Read one frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<(u8, Bytes)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            ProtocolViolation::OversizedFrame(len),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let mut body = Bytes::from(body);
    let tag = body.get_u8();
    Ok(Some((tag, body)))
}

/// Encode a Raft message body: cluster id, sender, payload.
pub fn encode_raft_body(cluster: ClusterId, from: MemberId, message: &RaftMessage) -> BytesMut {
    let mut body = BytesMut::new();
    marshal::put_cluster_id(&mut body, cluster);
    marshal::put_member_id(&mut body, from);
    message.marshal(&mut body);
    body
}

/// A decoded Raft message body.
pub struct RaftBody {
    pub cluster: ClusterId,
    pub from: MemberId,
    pub message: RaftMessage,
}

pub fn decode_raft_body(tag: u8, body: &mut Bytes) -> MarshalResult<RaftBody> {
    let cluster = marshal::get_cluster_id(body)?;
    let from = marshal::get_member_id(body)?;
    let message = RaftMessage::unmarshal(tag, body)?;
    Ok(RaftBody {
        cluster,
        from,
        message,
    })
}
