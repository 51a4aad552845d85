//! The id allocation state machine.
//!
//! Members claim contiguous id ranges by replicating an allocation
//! request naming the first unallocated id they observed. Requests whose
//! `range_start` no longer matches are stale (some other member won the
//! race) and allocate nothing.

use std::collections::BTreeMap;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;

use crate::marshal;
use crate::marshal::MarshalResult;
use crate::operation::AppliedResult;
use crate::operation::IdType;
use crate::MemberId;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IdAllocationMachine {
    first_unallocated: BTreeMap<IdType, u64>,
}

impl IdAllocationMachine {
    pub fn apply(
        &mut self,
        id_type: IdType,
        range_start: u64,
        range_length: u32,
        owner: MemberId,
    ) -> AppliedResult {
        let first = self.first_unallocated.entry(id_type).or_insert(0);
        if range_start != *first {
            tracing::debug!(
                %id_type,
                range_start,
                first_unallocated = *first,
                %owner,
                "stale id allocation request"
            );
            return AppliedResult::IdAllocationRejected;
        }
        *first += range_length as u64;
        AppliedResult::IdRangeAllocated {
            id_type,
            start: range_start,
            length: range_length,
        }
    }

    pub fn first_unallocated(&self, id_type: IdType) -> u64 {
        self.first_unallocated.get(&id_type).copied().unwrap_or(0)
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u32(self.first_unallocated.len() as u32);
        for (id_type, first) in &self.first_unallocated {
            buf.put_u16(id_type.0);
            buf.put_u64(*first);
        }
    }

    pub fn unmarshal(buf: &mut impl Buf) -> MarshalResult<Self> {
        let n = marshal::get_u32(buf)?;
        let mut first_unallocated = BTreeMap::new();
        for _ in 0..n {
            let id_type = IdType(marshal::get_u16(buf)?);
            first_unallocated.insert(id_type, marshal::get_u64(buf)?);
        }
        Ok(Self { first_unallocated })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn ranges_are_granted_in_order() {
        let mut machine = IdAllocationMachine::default();
        let owner = MemberId::from_u128(1);

        assert_eq!(
            machine.apply(IdType(0), 0, 1024, owner),
            AppliedResult::IdRangeAllocated {
                id_type: IdType(0),
                start: 0,
                length: 1024
            }
        );
        assert_eq!(machine.first_unallocated(IdType(0)), 1024);

        assert_eq!(
            machine.apply(IdType(0), 1024, 512, owner),
            AppliedResult::IdRangeAllocated {
                id_type: IdType(0),
                start: 1024,
                length: 512
            }
        );
    }

    #[test]
    fn stale_request_allocates_nothing() {
        let mut machine = IdAllocationMachine::default();
        let a = MemberId::from_u128(1);
        let b = MemberId::from_u128(2);

        machine.apply(IdType(0), 0, 100, a);
        // b raced with a and lost; its request names the old range start.
        assert_eq!(machine.apply(IdType(0), 0, 100, b), AppliedResult::IdAllocationRejected);
        assert_eq!(machine.first_unallocated(IdType(0)), 100);
    }

    #[test]
    fn id_types_are_independent() {
        let mut machine = IdAllocationMachine::default();
        let owner = MemberId::from_u128(1);
        machine.apply(IdType(0), 0, 10, owner);
        machine.apply(IdType(1), 0, 20, owner);
        assert_eq!(machine.first_unallocated(IdType(0)), 10);
        assert_eq!(machine.first_unallocated(IdType(1)), 20);
    }

    #[test]
    fn marshal_round_trip() {
        let mut machine = IdAllocationMachine::default();
        machine.apply(IdType(0), 0, 10, MemberId::from_u128(1));
        machine.apply(IdType(7), 0, 99, MemberId::from_u128(1));

        let mut buf = BytesMut::new();
        machine.marshal(&mut buf);
        let restored = IdAllocationMachine::unmarshal(&mut buf.freeze()).unwrap();
        assert_eq!(restored, machine);
    }
}
