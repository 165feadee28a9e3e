use std::fmt;

use crate::mem::RdmaBuffer;
use crate::msg::RdmaBufDesc;
use super::verbs::{RemoteMem, SendOp, SendWr, WrId};

/// Largest number of buffer pairs in one [`RdmaRwWork`].
pub const RW_WORK_BUFS_LIMIT: usize = 8;

/// Callback of a completed [`RdmaRwWork`]. It receives the work back, with
/// its buffers and the indexes of the pairs that failed.
pub type RwCallback = Box<dyn FnOnce(RdmaRwWork) + Send>;

/// A batch of one-sided reads or writes between local registered buffers
/// and remote buffer descriptors.
///
/// The work completes when every pair has completed; its callback fires
/// exactly once.
pub struct RdmaRwWork {
    pairs: Vec<(RdmaBuffer, RdmaBufDesc)>,
    is_write: bool,
    imm_data: u32,
    outstanding: usize,
    failed: Vec<usize>,
    callback: Option<RwCallback>,
}

impl fmt::Debug for RdmaRwWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaRwWork")
            .field("pairs", &self.pairs.len())
            .field("is_write", &self.is_write)
            .field("outstanding", &self.outstanding)
            .field("failed", &self.failed)
            .finish()
    }
}

impl RdmaRwWork {
    /// Read every remote buffer into its paired local buffer.
    pub fn read(
        pairs: Vec<(RdmaBuffer, RdmaBufDesc)>,
        callback: impl FnOnce(RdmaRwWork) + Send + 'static,
    ) -> Self {
        Self::new(pairs, false, 0, Box::new(callback))
    }

    /// Write every local buffer into its paired remote buffer. A non-zero
    /// `imm_data` is delivered to the peer with the last write.
    pub fn write(
        pairs: Vec<(RdmaBuffer, RdmaBufDesc)>,
        imm_data: u32,
        callback: impl FnOnce(RdmaRwWork) + Send + 'static,
    ) -> Self {
        Self::new(pairs, true, imm_data, Box::new(callback))
    }

    fn new(pairs: Vec<(RdmaBuffer, RdmaBufDesc)>, is_write: bool, imm_data: u32, callback: RwCallback) -> Self {
        Self {
            pairs,
            is_write,
            imm_data,
            outstanding: 0,
            failed: Vec::new(),
            callback: Some(callback),
        }
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        self.is_write
    }

    #[inline]
    pub fn imm_data(&self) -> u32 {
        self.imm_data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    #[inline]
    pub fn pairs(&self) -> &[(RdmaBuffer, RdmaBufDesc)] {
        &self.pairs
    }

    /// Indexes of the pairs whose transfer failed.
    #[inline]
    pub fn failed_indexes(&self) -> &[usize] {
        &self.failed
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    /// Take the local buffers back.
    pub fn into_buffers(self) -> Vec<RdmaBuffer> {
        self.pairs.into_iter().map(|(buf, _)| buf).collect()
    }

    /// Build one signaled work request per pair, all with `wr_id`, and arm
    /// the completion counter.
    pub(crate) fn start(&mut self, wr_id: WrId) -> Vec<SendWr> {
        let last = self.pairs.len().saturating_sub(1);
        let (is_write, imm) = (self.is_write, self.imm_data);
        self.outstanding = self.pairs.len();
        self.failed.clear();

        self.pairs
            .iter_mut()
            .enumerate()
            .map(|(i, (buf, desc))| {
                let remote = RemoteMem {
                    addr: desc.addr,
                    rkey: desc.rkey,
                };
                let (op, len) = if is_write {
                    let len = buf.len().min(desc.len as usize);
                    let op = if i == last && imm != 0 {
                        SendOp::WriteWithImm(remote, imm)
                    } else {
                        SendOp::Write(remote)
                    };
                    (op, len)
                } else {
                    let len = (desc.len as usize).min(buf.size());
                    buf.set_len(len);
                    (SendOp::Read(remote), len)
                };
                SendWr {
                    wr_id,
                    op,
                    sge: (len > 0).then(|| buf.sge(len)),
                    signaled: true,
                    inline: false,
                }
            })
            .collect()
    }

    /// Account one completion, in posting order. Return whether the work is
    /// complete.
    pub(crate) fn complete_one(&mut self, ok: bool) -> bool {
        if self.outstanding == 0 {
            return true;
        }
        if !ok {
            self.failed.push(self.pairs.len() - self.outstanding);
        }
        self.outstanding -= 1;
        self.outstanding == 0
    }

    /// Mark every pair not completed yet as failed.
    pub(crate) fn fail_rest(&mut self) {
        let done = if self.outstanding == 0 {
            // Never posted.
            0
        } else {
            self.pairs.len() - self.outstanding
        };
        self.failed.extend(done..self.pairs.len());
        self.outstanding = 0;
    }

    /// Fire the callback.
    pub(crate) fn finish(mut self) {
        if let Some(callback) = self.callback.take() {
            callback(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryManager;
    use crate::rdma::verbs::{Context, Pd};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};

    fn buffers(n: usize) -> anyhow::Result<(MemoryManager, Vec<RdmaBuffer>)> {
        let ctx = Context::open(None, 1, 0)?;
        let pd = Pd::new(&ctx)?;
        let mm = MemoryManager::with_levels(&pd, 4096, 12, 16, 4, false)?;
        let bufs = mm.get_buffers(n);
        Ok((mm, bufs))
    }

    fn desc(addr: u64, len: u32) -> RdmaBufDesc {
        RdmaBufDesc { addr, rkey: 1, len }
    }

    #[test]
    fn callback_fires_once_with_failures() -> anyhow::Result<()> {
        let (_mm, bufs) = buffers(3)?;
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let pairs = bufs
            .into_iter()
            .enumerate()
            .map(|(i, buf)| (buf, desc(0x1000 * (i as u64 + 1), 100)))
            .collect();
        let mut work = {
            let fired = fired.clone();
            RdmaRwWork::read(pairs, move |work| {
                fired.fetch_add(1, Ordering::SeqCst);
                tx.send(work.failed_indexes().to_vec()).unwrap();
            })
        };

        let wrs = work.start(77);
        assert_eq!(wrs.len(), 3);
        assert!(wrs.iter().all(|wr| wr.wr_id == 77 && wr.signaled));
        assert!(matches!(wrs[1].op, SendOp::Read(RemoteMem { addr: 0x2000, .. })));
        assert_eq!(work.pairs()[0].0.len(), 100);

        assert!(!work.complete_one(true));
        assert!(!work.complete_one(false));
        assert!(work.complete_one(true));
        work.finish();

        assert_eq!(rx.recv()?, vec![1]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn last_write_carries_immediate_data() -> anyhow::Result<()> {
        let (_mm, mut bufs) = buffers(2)?;
        for buf in &mut bufs {
            buf.set_len(64);
        }
        let pairs = bufs.into_iter().map(|buf| (buf, desc(0x8000, 32))).collect();
        let mut work = RdmaRwWork::write(pairs, 9, |_| {});
        let wrs = work.start(1);
        assert!(matches!(wrs[0].op, SendOp::Write(_)));
        assert!(matches!(wrs[1].op, SendOp::WriteWithImm(_, 9)));
        // Capped by the remote buffer.
        assert_eq!(wrs[1].sge.map(|sge| sge.length), Some(32));

        assert!(!work.complete_one(true));
        work.fail_rest();
        assert_eq!(work.failed_indexes(), &[1]);
        assert_eq!(work.into_buffers().len(), 2);
        Ok(())
    }
}
