use std::fmt::{self, Display};

use crate::{
    codec::{Decoder, Encoder, U16},
    error::{Error, Result},
};

/// Protocol revision carried at the front of every request.
pub const VERSION: Version = Version::new(0, 4, 9);

pub const VERSION_SIZE: usize = 3 * U16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub inc: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16, inc: u16) -> Self {
        Self { major, minor, inc }
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.encode_uint(self.major.into(), U16);
        enc.encode_uint(self.minor.into(), U16);
        enc.encode_uint(self.inc.into(), U16);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            major: dec.decode_u16()?,
            minor: dec.decode_u16()?,
            inc: dec.decode_u16()?,
        })
    }

    /// Called by the server with the tuple the client sent. Any difference
    /// aborts the session and names the side that is behind.
    pub fn check(client: Version, server: Version) -> Result<()> {
        if client == server {
            return Ok(());
        }

        let (side, older, newer) = if client < server {
            ("client", client, server)
        } else {
            ("server", server, client)
        };

        Err(Error::VersionMismatch { side, older, newer })
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.inc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_server_must_upgrade() {
        let err = Version::check(Version::new(0, 4, 6), Version::new(0, 4, 5)).unwrap_err();
        assert_eq!(err.to_string(), "upgrade qpbench on server from 0.4.5 to 0.4.6");
    }

    #[test]
    fn older_client_must_upgrade() {
        let err = Version::check(Version::new(0, 3, 9), Version::new(0, 4, 0)).unwrap_err();
        match err {
            Error::VersionMismatch { side, older, newer } => {
                assert_eq!(side, "client");
                assert_eq!(older, Version::new(0, 3, 9));
                assert_eq!(newer, Version::new(0, 4, 0));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn matching_versions_pass() {
        assert!(Version::check(VERSION, VERSION).is_ok());
    }
}
