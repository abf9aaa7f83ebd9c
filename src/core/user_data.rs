/*
* IO_Uring accepts a 64-bit integer called user_data per submission to the submission queue.
* The primary reactor uses it to tell completions apart:
*
* 1. Which operation - Accept on a listener, Readable on a worker channel, or the reap Tick.
*
* 2. Which slot the operation belongs to - a listener slot for Accept, a worker id for Readable.
*/

const OPCODE_BITS: u64 = 8;
const ID_BITS: u64 = 64 - OPCODE_BITS;

const OPCODE_MASK: u64 = (1 << OPCODE_BITS) - 1; // 0xFF
const ID_MASK: u64 = (1 << ID_BITS) - 1; // 0x00FF_FFFF_FFFF_FFFF

const ID_SHIFT: u64 = OPCODE_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Accept = 1,
    Readable = 2,
    Tick = 3,
}

impl Operation {
    fn try_from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Accept),
            2 => Some(Self::Readable),
            3 => Some(Self::Tick),
            _ => None,
        }
    }
}

#[inline]
pub fn pack_user_data(id: u64, op: Operation) -> u64 {
    debug_assert!((id & !ID_MASK) == 0, "slot id exceeds 56 bits");
    ((id & ID_MASK) << ID_SHIFT) | (op as u64 & OPCODE_MASK)
}

/// `None` for tags this reactor never produced.
#[inline]
pub fn unpack_user_data(tag: u64) -> Option<(u64, Operation)> {
    let id = (tag >> ID_SHIFT) & ID_MASK;
    let op = Operation::try_from_u8((tag & OPCODE_MASK) as u8)?;
    Some((id, op))
}
