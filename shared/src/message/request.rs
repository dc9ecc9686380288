use crate::{
    codec::{Decoder, Encoder, U16, U32},
    error::Result,
};

use super::version::{Version, VERSION, VERSION_SIZE};

/// Size of the two string fields of a request.
pub const STRING_SIZE: usize = 64;

const NUMERIC_FIELDS: usize = 16;

pub const REQUEST_SIZE: usize = VERSION_SIZE + U16 + NUMERIC_FIELDS * U32 + 2 * STRING_SIZE;

/// Negotiated test configuration as seen by one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub version: Version,
    pub req_index: u16,
    pub access_recv: u32,
    pub affinity: u32,
    pub alt_port: u32,
    pub flip: u32,
    pub msg_size: u32,
    pub mtu_size: u32,
    pub no_msgs: u32,
    pub poll_mode: u32,
    pub port: u32,
    pub rd_atomic: u32,
    pub service_level: u32,
    pub sock_buf_size: u32,
    pub src_path_bits: u32,
    pub time: u32,
    pub timeout: u32,
    pub use_cm: u32,
    pub id: String,
    pub static_rate: String,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            version: VERSION,
            req_index: 0,
            access_recv: 0,
            affinity: 0,
            alt_port: 0,
            flip: 0,
            msg_size: 0,
            mtu_size: 0,
            no_msgs: 0,
            poll_mode: 0,
            port: 0,
            rd_atomic: 0,
            service_level: 0,
            sock_buf_size: 0,
            src_path_bits: 0,
            time: 0,
            timeout: 0,
            use_cm: 0,
            id: String::new(),
            static_rate: String::new(),
        }
    }
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(REQUEST_SIZE);
        self.version.encode(&mut enc);
        enc.encode_uint(self.req_index.into(), U16);
        for value in [
            self.access_recv,
            self.affinity,
            self.alt_port,
            self.flip,
            self.msg_size,
            self.mtu_size,
            self.no_msgs,
            self.poll_mode,
            self.port,
            self.rd_atomic,
            self.service_level,
            self.sock_buf_size,
            self.src_path_bits,
            self.time,
            self.timeout,
            self.use_cm,
        ] {
            enc.encode_uint(value.into(), U32);
        }
        enc.encode_str(&self.id, STRING_SIZE);
        enc.encode_str(&self.static_rate, STRING_SIZE);
        debug_assert_eq!(enc.len(), REQUEST_SIZE);
        enc.finish()
    }

    /// Decodes the fields that follow the version prefix. The caller must
    /// already have decoded and accepted `version`, since the layout of the
    /// body is only defined for a matching revision.
    pub fn decode_body(version: Version, body: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(body);
        Ok(Self {
            version,
            req_index: dec.decode_u16()?,
            access_recv: dec.decode_u32()?,
            affinity: dec.decode_u32()?,
            alt_port: dec.decode_u32()?,
            flip: dec.decode_u32()?,
            msg_size: dec.decode_u32()?,
            mtu_size: dec.decode_u32()?,
            no_msgs: dec.decode_u32()?,
            poll_mode: dec.decode_u32()?,
            port: dec.decode_u32()?,
            rd_atomic: dec.decode_u32()?,
            service_level: dec.decode_u32()?,
            sock_buf_size: dec.decode_u32()?,
            src_path_bits: dec.decode_u32()?,
            time: dec.decode_u32()?,
            timeout: dec.decode_u32()?,
            use_cm: dec.decode_u32()?,
            id: dec.decode_str(STRING_SIZE)?,
            static_rate: dec.decode_str(STRING_SIZE)?,
        })
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let version = Version::decode(&mut dec)?;
        Self::decode_body(version, &buf[dec.position()..])
    }

    pub fn flipped(&self) -> bool {
        self.flip != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_fixed() {
        let req = Request {
            req_index: 3,
            msg_size: 65536,
            time: 2,
            id: "mlx5_0:1".into(),
            static_rate: "10".into(),
            ..Default::default()
        };
        let buf = req.encode();
        assert_eq!(buf.len(), REQUEST_SIZE);
        assert_eq!(&buf[..6], &[0, 0, 4, 0, 9, 0]);
        assert_eq!(&buf[6..8], &[3, 0]);
        // msg_size is the fifth numeric field
        assert_eq!(&buf[8 + 4 * 4..8 + 5 * 4], &65536u32.to_le_bytes());
        assert_eq!(Request::decode(&buf).unwrap(), req);
    }

    #[test]
    fn long_strings_are_cut_to_field_size() {
        let req = Request {
            id: "x".repeat(STRING_SIZE + 10),
            ..Default::default()
        };
        let decoded = Request::decode(&req.encode()).unwrap();
        assert_eq!(decoded.id.len(), STRING_SIZE);
    }
}
