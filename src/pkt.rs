//! 4-hex-digit length-prefixed framing used on the wire.

use crate::errors::{Error, Result};
use std::io::{ErrorKind, Read, Write};

/// Data frames of a side-band stream.
pub const CH_DATA: u8 = 1;
/// Progress text a UI may show.
pub const CH_PROGRESS: u8 = 2;
/// Fatal error just before the peer aborts.
pub const CH_ERROR: u8 = 3;

/// Payload capacity negotiated by `side-band` / `side-band-64k`.
pub const SIDE_BAND_DATA_MAX: usize = 1000 - 5;
pub const SIDE_BAND_64K_DATA_MAX: usize = 65520 - 5;

const MAX_PAYLOAD: usize = 65520 - 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// `0000`: a record separator, not an empty line.
    Flush,
    Line(Vec<u8>),
}

impl Packet {
    /// Line payload with a trailing newline removed, or `None` for a
    /// flush packet.
    pub fn text(&self) -> Option<&[u8]> {
        match self {
            Packet::Flush => None,
            Packet::Line(data) => Some(match data.last() {
                Some(b'\n') => &data[..data.len() - 1],
                _ => data,
            }),
        }
    }
}

pub struct PacketLineOut<W: Write> {
    inner: W,
}

impl<W: Write> PacketLineOut<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_line(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD {
            return Err(Error::Protocol(format!(
                "cannot frame a {} byte payload",
                payload.len()
            )));
        }
        write!(self.inner, "{:04x}", payload.len() + 4)?;
        self.inner.write_all(payload)?;
        Ok(())
    }

    /// Frame a textual line, newline appended the way the protocol
    /// expects.
    pub fn write_text(&mut self, line: &str) -> Result<()> {
        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');
        self.write_line(&payload)
    }

    /// A `0000` flush packet; never confused with an empty line,
    /// which is unrepresentable on the wire.
    pub fn flush(&mut self) -> Result<()> {
        self.inner.write_all(b"0000")?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn write_side_band(&mut self, channel: u8, data: &[u8], max: usize) -> Result<()> {
        for chunk in data.chunks(max) {
            let mut payload = Vec::with_capacity(chunk.len() + 1);
            payload.push(channel);
            payload.extend_from_slice(chunk);
            self.write_line(&payload)?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct PacketLineIn<R: Read> {
    inner: R,
}

impl<R: Read> PacketLineIn<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one frame; clean EOF at a frame boundary is `None`.
    pub fn read_opt(&mut self) -> Result<Option<Packet>> {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            match self.inner.read(&mut prefix[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(Error::Protocol("truncated length prefix".into())),
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        let declared = parse_hex4(&prefix)?;
        match declared {
            0 => Ok(Some(Packet::Flush)),
            1..=3 => Err(Error::Protocol(format!("invalid frame length {declared}"))),
            _ => {
                let mut payload = vec![0u8; declared - 4];
                self.inner.read_exact(&mut payload).map_err(|_| {
                    Error::Protocol(format!("frame truncated at {} bytes", declared - 4))
                })?;
                Ok(Some(Packet::Line(payload)))
            }
        }
    }

    pub fn read(&mut self) -> Result<Packet> {
        self.read_opt()?
            .ok_or_else(|| Error::Protocol("unexpected end of stream".into()))
    }

    /// Demultiplex a side-band stream until its flush packet: data
    /// frames are copied to `out`, progress text is logged, channel 3
    /// aborts with the peer's message.
    pub fn copy_side_band<W: Write>(&mut self, out: &mut W) -> Result<()> {
        loop {
            match self.read_opt()? {
                None | Some(Packet::Flush) => return Ok(()),
                Some(Packet::Line(frame)) => {
                    let Some((&channel, rest)) = frame.split_first() else {
                        return Err(Error::Protocol("side-band frame without channel".into()));
                    };
                    match channel {
                        CH_DATA => out.write_all(rest)?,
                        CH_PROGRESS => {
                            tracing::info!(
                                "remote: {}",
                                String::from_utf8_lossy(rest).trim_end()
                            );
                        }
                        CH_ERROR => {
                            return Err(Error::Protocol(format!(
                                "remote error: {}",
                                String::from_utf8_lossy(rest).trim_end()
                            )));
                        }
                        other => {
                            return Err(Error::Protocol(format!(
                                "unrecognized side-band channel {other}"
                            )));
                        }
                    }
                }
            }
        }
    }
}

fn parse_hex4(prefix: &[u8; 4]) -> Result<usize> {
    let mut value = 0usize;
    for &b in prefix {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => {
                return Err(Error::Protocol(format!(
                    "bad length prefix {:?}",
                    String::from_utf8_lossy(prefix)
                )))
            }
        };
        value = value << 4 | digit as usize;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_round_trip() {
        let mut buf = Vec::new();
        let mut out = PacketLineOut::new(&mut buf);
        out.write_text("want 0123").unwrap();
        out.flush().unwrap();
        out.write_line(b"done\n").unwrap();

        let mut input = PacketLineIn::new(Cursor::new(buf));
        let first = input.read().unwrap();
        assert_eq!(first.text().unwrap(), b"want 0123");
        assert_eq!(input.read().unwrap(), Packet::Flush);
        assert_eq!(input.read().unwrap().text().unwrap(), b"done");
        assert!(input.read_opt().unwrap().is_none());
    }

    #[test]
    fn declared_length_includes_the_prefix() {
        let mut buf = Vec::new();
        PacketLineOut::new(&mut buf).write_line(b"a").unwrap();
        assert_eq!(&buf, b"0005a");
    }

    #[test]
    fn bad_lengths_are_protocol_errors() {
        for raw in [&b"zzzz"[..], &b"0002"[..], &b"0008ab"[..]] {
            let mut input = PacketLineIn::new(Cursor::new(raw.to_vec()));
            assert!(matches!(input.read(), Err(Error::Protocol(_))));
        }
    }

    #[test]
    fn side_band_demux_splits_channels() {
        let mut buf = Vec::new();
        let mut out = PacketLineOut::new(&mut buf);
        out.write_side_band(CH_DATA, b"PACKdata", SIDE_BAND_DATA_MAX)
            .unwrap();
        out.write_side_band(CH_PROGRESS, b"counting...\n", SIDE_BAND_DATA_MAX)
            .unwrap();
        out.write_side_band(CH_DATA, b"more", SIDE_BAND_DATA_MAX)
            .unwrap();
        out.flush().unwrap();

        let mut data = Vec::new();
        PacketLineIn::new(Cursor::new(buf))
            .copy_side_band(&mut data)
            .unwrap();
        assert_eq!(&data, b"PACKdatamore");
    }

    #[test]
    fn side_band_error_channel_aborts() {
        let mut buf = Vec::new();
        let mut out = PacketLineOut::new(&mut buf);
        out.write_side_band(CH_ERROR, b"access denied\n", SIDE_BAND_DATA_MAX)
            .unwrap();

        let mut data = Vec::new();
        let err = PacketLineIn::new(Cursor::new(buf))
            .copy_side_band(&mut data)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(msg) if msg.contains("access denied")));
    }

    #[test]
    fn large_payloads_chunk_at_the_band_limit() {
        let mut buf = Vec::new();
        let mut out = PacketLineOut::new(&mut buf);
        let payload = vec![0x61u8; SIDE_BAND_DATA_MAX * 2 + 10];
        out.write_side_band(CH_DATA, &payload, SIDE_BAND_DATA_MAX)
            .unwrap();
        out.flush().unwrap();

        let mut data = Vec::new();
        PacketLineIn::new(Cursor::new(buf))
            .copy_side_band(&mut data)
            .unwrap();
        assert_eq!(data, payload);
    }
}
