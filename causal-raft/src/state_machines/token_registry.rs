//! The token registry state machine.
//!
//! Binds token names to small integer ids. Creation is first-writer-wins:
//! a name that is already bound keeps its original id and the duplicate
//! creator receives that id as its result.

use std::collections::BTreeMap;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;

use crate::marshal;
use crate::marshal::MarshalResult;
use crate::operation::AppliedResult;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TokenRegistry {
    by_name: BTreeMap<String, u32>,
}

impl TokenRegistry {
    pub fn apply(&mut self, name: &str, proposed_id: u32) -> AppliedResult {
        if let Some(existing) = self.by_name.get(name) {
            return AppliedResult::TokenId(*existing);
        }
        self.by_name.insert(name.to_string(), proposed_id);
        AppliedResult::TokenId(proposed_id)
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u32(self.by_name.len() as u32);
        for (name, id) in &self.by_name {
            marshal::put_string(buf, name);
            buf.put_u32(*id);
        }
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        let n = marshal::get_u32(buf)?;
        let mut by_name = BTreeMap::new();
        for _ in 0..n {
            let name = marshal::get_string(buf)?;
            by_name.insert(name, marshal::get_u32(buf)?);
        }
        Ok(Self { by_name })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn first_writer_wins() {
        let mut registry = TokenRegistry::default();
        assert_eq!(registry.apply("label", 1), AppliedResult::TokenId(1));
        assert_eq!(registry.apply("label", 2), AppliedResult::TokenId(1));
        assert_eq!(registry.get("label"), Some(1));
    }

    #[test]
    fn marshal_round_trip() {
        let mut registry = TokenRegistry::default();
        registry.apply("label", 1);
        registry.apply("rel-type", 2);

        let mut buf = BytesMut::new();
        registry.marshal(&mut buf);
        assert_eq!(TokenRegistry::unmarshal(&mut buf.freeze()).unwrap(), registry);
    }
}
