//! The checkpoint record embedded in the control file and in
//! `XLOG_CHECKPOINT_*` WAL records (§3 Control file, §4.H step 7).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use utils::id::TimeLineID;
use utils::lsn::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckPoint {
    /// LSN of the checkpoint's REDO pointer: replay must start here, not at
    /// the checkpoint record's own LSN.
    pub redo: Lsn,
    pub this_timeline_id: TimeLineID,
    pub next_xid_epoch: u32,
    pub next_xid: u32,
}

pub const SIZEOF_CHECKPOINT: usize = 8 + 4 + 4 + 4;

impl CheckPoint {
    pub(crate) fn decode_from(buf: &mut Bytes) -> CheckPoint {
        CheckPoint {
            redo: Lsn(buf.get_u64_le()),
            this_timeline_id: TimeLineID(buf.get_u32_le()),
            next_xid_epoch: buf.get_u32_le(),
            next_xid: buf.get_u32_le(),
        }
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.redo.0);
        buf.put_u32_le(self.this_timeline_id.0);
        buf.put_u32_le(self.next_xid_epoch);
        buf.put_u32_le(self.next_xid);
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<CheckPoint> {
        anyhow::ensure!(
            buf.len() >= SIZEOF_CHECKPOINT,
            "checkpoint record too short: {} < {}",
            buf.len(),
            SIZEOF_CHECKPOINT
        );
        let mut b = Bytes::copy_from_slice(&buf[..SIZEOF_CHECKPOINT]);
        Ok(CheckPoint::decode_from(&mut b))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SIZEOF_CHECKPOINT);
        self.encode_into(&mut buf);
        buf.freeze()
    }
}
