//! Single urgent bytes sent outside the in-band message order.

use std::{net::TcpStream, os::fd::AsRawFd};

use nix::{
    errno::Errno,
    sys::socket::{recv, send, MsgFlags},
};

use crate::error::{Error, Result};

/// The peer closed its test window.
pub const FINISHED: u8 = b'.';

/// The peer hit a fatal error; its text follows in band.
pub const FAILED: u8 = b'!';

/// Marks the start of the error text in the in-band stream.
pub const ERROR_TAG: &[u8] = b"\x1bqpbench-error:";

pub fn send_urgent(stream: &TcpStream, byte: u8) -> Result<()> {
    loop {
        match send(stream.as_raw_fd(), &[byte], MsgFlags::MSG_OOB) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR | Errno::EAGAIN) => continue,
            Err(e) => return Err(Error::os("send urgent byte", e)),
        }
    }
}

/// Reads a pending urgent byte, if there is one.
pub fn recv_urgent(stream: &TcpStream) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match recv(stream.as_raw_fd(), &mut byte, MsgFlags::MSG_OOB) {
            Ok(1) => return Ok(Some(byte[0])),
            Ok(_) => return Ok(None),
            Err(Errno::EINTR) => continue,
            // EINVAL: no urgent data, or it was already consumed
            Err(Errno::EAGAIN | Errno::EINVAL) => return Ok(None),
            Err(e) => return Err(Error::os("receive urgent byte", e)),
        }
    }
}

/// Picks the error text out of whatever in-band bytes were drained after
/// a failure notification.
pub fn extract_error_text(drained: &[u8]) -> String {
    let text = drained
        .windows(ERROR_TAG.len())
        .rposition(|window| window == ERROR_TAG)
        .map(|at| &drained[at + ERROR_TAG.len()..])
        .unwrap_or(drained);

    let text = String::from_utf8_lossy(text);
    let text = text.trim_matches(|c: char| c.is_control() || c.is_whitespace());
    if text.is_empty() {
        "failed without a message".to_owned()
    } else {
        text.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn urgent_byte_skips_in_band_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        client.write_all(b"ab").unwrap();
        send_urgent(&client, FAILED).unwrap();
        client.write_all(b"cd").unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(recv_urgent(&server).unwrap(), Some(FAILED));
        assert_eq!(recv_urgent(&server).unwrap(), None);

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn error_text_follows_last_tag() {
        let mut drained = b"SyN".to_vec();
        drained.extend_from_slice(ERROR_TAG);
        drained.extend_from_slice(b"msg_size: must be nonzero\n");
        assert_eq!(extract_error_text(&drained), "msg_size: must be nonzero");
        assert_eq!(extract_error_text(b""), "failed without a message");
    }
}
