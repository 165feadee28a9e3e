//! Work request identifiers.
//!
//! The top bits of a work request ID tell what the request carried, so that
//! a completion can be routed without looking anything up; the low bits are
//! a sequence number.

use super::verbs::WrId;

const KIND_SHIFT: u32 = 60;
const SEQ_MASK: u64 = (1 << KIND_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WrKind {
    /// A receive buffer.
    Recv = 1,
    /// A chunk of two-sided message data.
    Send = 2,
    /// A one-sided read or write of an [`RdmaRwWork`](super::RdmaRwWork).
    Rw = 3,
    /// The zero-length close notification.
    Fin = 4,
    /// A zero-length send with immediate data.
    Imm = 5,
}

#[inline]
pub(crate) fn make_wr_id(kind: WrKind, seq: u64) -> WrId {
    ((kind as u64) << KIND_SHIFT) | (seq & SEQ_MASK)
}

#[inline]
pub(crate) fn wr_kind(wr_id: WrId) -> Option<WrKind> {
    Some(match wr_id >> KIND_SHIFT {
        1 => WrKind::Recv,
        2 => WrKind::Send,
        3 => WrKind::Rw,
        4 => WrKind::Fin,
        5 => WrKind::Imm,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_large_sequences() {
        let id = make_wr_id(WrKind::Rw, u64::MAX);
        assert_eq!(wr_kind(id), Some(WrKind::Rw));
        assert_eq!(id & SEQ_MASK, SEQ_MASK);
        assert_eq!(wr_kind(make_wr_id(WrKind::Fin, 3)), Some(WrKind::Fin));
        assert_eq!(wr_kind(42), None);
    }
}
