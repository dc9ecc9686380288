/// The operation a send-queue entry performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Send,
    Write,
    /// Write that also consumes a receive on the target.
    WriteImm(u32),
    Read,
    CompareSwap { compare: u64, swap: u64 },
    FetchAdd(u64),
}

impl Opcode {
    pub fn is_atomic(self) -> bool {
        matches!(self, Opcode::CompareSwap { .. } | Opcode::FetchAdd(_))
    }

    /// Whether the operation addresses the peer's buffer.
    pub fn is_one_sided(self) -> bool {
        !matches!(self, Opcode::Send)
    }
}

/// One send-queue entry. `offset` and `len` select the local bytes that are
/// sent, written, or filled by a read or atomic result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRequest {
    pub wr_id: u64,
    pub opcode: Opcode,
    pub offset: usize,
    pub len: usize,
    pub remote_addr: u64,
    pub rkey: u32,
    pub signaled: bool,
}

impl WorkRequest {
    pub fn send(wr_id: u64, offset: usize, len: usize) -> Self {
        Self {
            wr_id,
            opcode: Opcode::Send,
            offset,
            len,
            remote_addr: 0,
            rkey: 0,
            signaled: true,
        }
    }

    /// A one-sided operation against `remote_addr` in the peer's buffer.
    pub fn remote(
        wr_id: u64,
        opcode: Opcode,
        offset: usize,
        len: usize,
        remote_addr: u64,
        rkey: u32,
    ) -> Self {
        Self {
            wr_id,
            opcode,
            offset,
            len,
            remote_addr,
            rkey,
            signaled: true,
        }
    }
}
