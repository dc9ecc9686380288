#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Write,
    Read,
    CompareSwap,
    FetchAdd,
    Recv,
    RecvImm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub opcode: WcOpcode,
    pub status: WcStatus,
    pub byte_len: u32,
}

impl WorkCompletion {
    pub fn success(wr_id: u64, opcode: WcOpcode, byte_len: usize) -> Self {
        Self {
            wr_id,
            opcode,
            status: WcStatus::Success,
            byte_len: byte_len as u32,
        }
    }

    pub fn failed(wr_id: u64, opcode: WcOpcode, reason: impl Into<String>) -> Self {
        Self {
            wr_id,
            opcode,
            status: WcStatus::Failed(reason.into()),
            byte_len: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }

    pub fn is_receive(&self) -> bool {
        matches!(self.opcode, WcOpcode::Recv | WcOpcode::RecvImm)
    }
}
