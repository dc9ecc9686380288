use crate::{
    error::{Error, Result},
    message::Request,
};

/// Global routing header prepended to every datagram a UD receive lands.
pub const GRH_SIZE: usize = 40;

const DEFAULT_MTU: u32 = 2048;
const DEFAULT_PORT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    /// Reliable connected.
    Rc,
    /// Unreliable connected.
    Uc,
    /// Unreliable datagram.
    Ud,
}

impl QpType {
    pub fn name(self) -> &'static str {
        match self {
            QpType::Rc => "RC",
            QpType::Uc => "UC",
            QpType::Ud => "UD",
        }
    }

    /// Bytes a receive must reserve ahead of the payload.
    pub fn recv_overhead(self) -> usize {
        match self {
            QpType::Ud => GRH_SIZE,
            QpType::Rc | QpType::Uc => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Device name, or `None` for the first one found.
    pub device: Option<String>,
    pub port: u8,
    pub qp_type: QpType,
    pub buffer_size: usize,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub rd_atomic: u8,
    pub mtu: u32,
    pub service_level: u8,
    pub src_path_bits: u8,
    /// Encoded injection rate limit; 0 leaves the port rate alone.
    pub static_rate: u8,
}

impl Config {
    /// Derives the queue pair settings from a negotiated request.
    pub fn from_request(
        req: &Request,
        qp_type: QpType,
        buffer_size: usize,
        depth: u32,
    ) -> Result<Self> {
        if req.use_cm != 0 {
            return Err(Error::Unsupported("connection manager setup".into()));
        }

        let (device, port) = parse_id(&req.id)?;
        let mtu = match req.mtu_size {
            0 => DEFAULT_MTU,
            mtu @ (256 | 512 | 1024 | 2048 | 4096) => mtu,
            other => {
                return Err(Error::invalid(
                    "mtu_size",
                    format!("{other} is not one of 256, 512, 1024, 2048 or 4096"),
                ))
            }
        };

        Ok(Self {
            device,
            port,
            qp_type,
            buffer_size,
            max_send_wr: depth,
            max_recv_wr: depth,
            rd_atomic: narrow("rd_atomic", req.rd_atomic.max(1))?,
            mtu,
            service_level: narrow("service_level", req.service_level)?,
            src_path_bits: narrow("src_path_bits", req.src_path_bits)?,
            static_rate: parse_static_rate(&req.static_rate)?,
        })
    }
}

fn narrow(name: &str, value: u32) -> Result<u8> {
    u8::try_from(value).map_err(|_| Error::invalid(name, format!("{value} is out of range")))
}

/// Splits an identity of the form `device[:port]`.
fn parse_id(id: &str) -> Result<(Option<String>, u8)> {
    if id.is_empty() {
        return Ok((None, DEFAULT_PORT));
    }
    match id.split_once(':') {
        None => Ok((Some(id.to_owned()), DEFAULT_PORT)),
        Some((device, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::invalid("id", format!("bad port in {id:?}")))?;
            Ok((Some(device.to_owned()), port))
        }
    }
}

/// Maps a rate in Gb/s onto the verbs rate encoding.
pub fn parse_static_rate(rate: &str) -> Result<u8> {
    let code = match rate.trim().to_ascii_lowercase().as_str() {
        "" | "max" => 0,
        "2.5" | "sdr" => 2,
        "5" | "ddr" => 5,
        "10" | "qdr" => 3,
        "14" | "fdr10" => 11,
        "20" => 6,
        "25" | "edr" => 15,
        "30" => 4,
        "40" => 7,
        "56" | "fdr" => 12,
        "60" => 8,
        "80" => 9,
        "100" => 16,
        "120" => 10,
        "200" | "hdr" => 17,
        other => {
            return Err(Error::invalid(
                "static_rate",
                format!("unknown rate {other:?}"),
            ))
        }
    };
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_selects_device_and_port() {
        assert_eq!(parse_id("").unwrap(), (None, 1));
        assert_eq!(parse_id("mlx5_0").unwrap(), (Some("mlx5_0".into()), 1));
        assert_eq!(parse_id("mlx5_0:2").unwrap(), (Some("mlx5_0".into()), 2));
        assert!(parse_id("mlx5_0:x").is_err());
    }

    #[test]
    fn request_values_are_checked() {
        let req = Request {
            mtu_size: 1000,
            ..Default::default()
        };
        assert!(Config::from_request(&req, QpType::Rc, 64, 16).is_err());

        let req = Request {
            rd_atomic: 0,
            static_rate: "qdr".into(),
            ..Default::default()
        };
        let config = Config::from_request(&req, QpType::Ud, 64, 16).unwrap();
        assert_eq!(config.rd_atomic, 1);
        assert_eq!(config.mtu, 2048);
        assert_eq!(config.static_rate, 3);

        let req = Request {
            use_cm: 1,
            ..Default::default()
        };
        assert!(matches!(
            Config::from_request(&req, QpType::Rc, 64, 16),
            Err(Error::Unsupported(_))
        ));
    }
}
