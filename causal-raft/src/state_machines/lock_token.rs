//! The replicated lock token state machine.
//!
//! At most one member holds the lock token at a time. A candidate must
//! name the successor of the current token id; anything else is a stale
//! request and is refused, so a deposed leader cannot reclaim lock
//! authority with an old token.

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;

use crate::marshal;
use crate::marshal::MarshalResult;
use crate::operation::AppliedResult;
use crate::MemberId;

/// The token id meaning "never granted".
pub const INVALID_LOCK_TOKEN_ID: u32 = 0;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LockTokenMachine {
    current_id: u32,
    owner: Option<MemberId>,
}

impl LockTokenMachine {
    pub fn apply(&mut self, candidate_id: u32, owner: MemberId) -> AppliedResult {
        let expected = self.current_id.wrapping_add(1).max(1);
        if candidate_id != expected {
            tracing::debug!(candidate_id, expected, %owner, "stale lock token request refused");
            return AppliedResult::LockToken {
                candidate_id,
                granted: false,
            };
        }
        self.current_id = candidate_id;
        self.owner = Some(owner);
        AppliedResult::LockToken {
            candidate_id,
            granted: true,
        }
    }

    pub fn current(&self) -> (u32, Option<MemberId>) {
        (self.current_id, self.owner)
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u32(self.current_id);
        match self.owner {
            Some(owner) => {
                marshal::put_bool(buf, true);
                marshal::put_member_id(buf, owner);
            }
            None => marshal::put_bool(buf, false),
        }
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        let current_id = marshal::get_u32(buf)?;
        let owner = if marshal::get_bool(buf)? {
            Some(marshal::get_member_id(buf)?)
        } else {
            None
        };
        Ok(Self { current_id, owner })
    }
}
