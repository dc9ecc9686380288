use crate::{
    codec::{Decoder, Encoder, U16, U32, U64},
    error::Result,
};

const GID_SIZE: usize = 16;

pub const QP_INFO_SIZE: usize = U16 + 3 * U32 + GID_SIZE + U32 + U64;

/// Addressing information for one queue pair and the buffer it exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QpInfo {
    pub lid: u16,
    pub qpn: u32,
    pub psn: u32,
    pub qkey: u32,
    pub gid: [u8; GID_SIZE],
    pub rkey: u32,
    pub vaddr: u64,
}

impl QpInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(QP_INFO_SIZE);
        enc.encode_uint(self.lid.into(), U16);
        enc.encode_uint(self.qpn.into(), U32);
        enc.encode_uint(self.psn.into(), U32);
        enc.encode_uint(self.qkey.into(), U32);
        enc.encode_bytes(&self.gid, GID_SIZE);
        enc.encode_uint(self.rkey.into(), U32);
        enc.encode_uint(self.vaddr, U64);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let lid = dec.decode_u16()?;
        let qpn = dec.decode_u32()?;
        let psn = dec.decode_u32()?;
        let qkey = dec.decode_u32()?;
        let mut gid = [0u8; GID_SIZE];
        gid.copy_from_slice(dec.decode_bytes(GID_SIZE)?);
        Ok(Self {
            lid,
            qpn,
            psn,
            qkey,
            gid,
            rkey: dec.decode_u32()?,
            vaddr: dec.decode_u64()?,
        })
    }

    /// Whether the peer must be reached through a global route.
    pub fn is_global(&self) -> bool {
        self.gid[8..].iter().any(|&b| b != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_endpoint_in_fixed_size() {
        let info = QpInfo {
            lid: 3,
            qpn: 0x1234,
            psn: 0xabcdef,
            qkey: 0x11111111,
            gid: [7; GID_SIZE],
            rkey: 99,
            vaddr: 0x7f00_0000_1000,
        };
        let buf = info.encode();
        assert_eq!(buf.len(), QP_INFO_SIZE);
        assert_eq!(QpInfo::decode(&buf).unwrap(), info);
        assert!(info.is_global());
        assert!(!QpInfo::default().is_global());
    }
}
