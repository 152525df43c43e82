//! Newline framing for the link, as a tokio-util codec.
//!
//! Bytes may arrive in arbitrary chunks: a line can be split across reads and
//! one read can carry several lines. The decoder keeps partial data in the
//! frame buffer and only yields a [`Command`] once its `\n` has been seen.

use super::protocol::{Command, OutboundMessage};
use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// Longest line accepted from the device, newline excluded.
pub const MAX_LINE_LENGTH: usize = 256;

#[derive(Debug, Default)]
pub struct LineCodec {
    // Where to resume the newline search; bytes before it were already scanned.
    next_index: usize,
    // Dropping an oversized line until its newline shows up.
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = Command;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Command>, io::Error> {
        loop {
            let start = self.next_index.min(buf.len());
            let newline = buf[start..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if buf.len() > MAX_LINE_LENGTH {
                    warn!(
                        "Discarding {} bytes without line terminator from device",
                        buf.len()
                    );
                    buf.clear();
                    self.discarding = true;
                    self.next_index = 0;
                } else {
                    self.next_index = buf.len();
                }
                return Ok(None);
            };

            let line = buf.split_to(start + offset + 1);
            self.next_index = 0;

            if self.discarding {
                self.discarding = false;
                continue;
            }

            if line.len() - 1 > MAX_LINE_LENGTH {
                warn!(
                    "Discarding {} byte line from device, longer than {}",
                    line.len() - 1,
                    MAX_LINE_LENGTH
                );
                continue;
            }

            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }

            return Ok(Some(Command::parse(trimmed)));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Command>, io::Error> {
        let command = self.decode(buf)?;
        if command.is_none() && !buf.is_empty() {
            debug!("Dropping {} bytes of unterminated line at end of stream", buf.len());
            buf.clear();
            self.next_index = 0;
            self.discarding = false;
        }
        Ok(command)
    }
}

impl Encoder<OutboundMessage> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, message: OutboundMessage, dst: &mut BytesMut) -> Result<(), io::Error> {
        let line = message.to_string();
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &[u8] = b"ROLL\r\nPING\n\nWIN:Teddy Bear\nstatus\n  \nBOGUS\nDISCONNECTED\n";

    fn expected() -> Vec<Command> {
        vec![
            Command::Roll,
            Command::Ping,
            Command::Win(Some("Teddy Bear".to_string())),
            Command::StatusQuery,
            Command::Unknown("BOGUS".to_string()),
            Command::Disconnect,
        ]
    }

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<Command> {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(command) = codec.decode(&mut buf).unwrap() {
                out.push(command);
            }
        }
        while let Some(command) = codec.decode_eof(&mut buf).unwrap() {
            out.push(command);
        }
        out
    }

    #[test]
    fn whole_stream_in_one_chunk() {
        assert_eq!(decode_chunks(&[STREAM]), expected());
    }

    #[test]
    fn byte_at_a_time() {
        let chunks: Vec<&[u8]> = STREAM.chunks(1).collect();
        assert_eq!(decode_chunks(&chunks), expected());
    }

    #[test]
    fn every_two_way_split_gives_same_commands() {
        for split in 0..=STREAM.len() {
            let (head, tail) = STREAM.split_at(split);
            assert_eq!(
                decode_chunks(&[head, &b""[..], tail]),
                expected(),
                "split at {}",
                split
            );
        }
    }

    #[test]
    fn uneven_chunks_with_empty_reads() {
        let chunks: [&[u8]; 7] = [
            b"",
            b"RO",
            b"LL\r",
            b"",
            b"\nPING\n\nWIN:Ted",
            b"dy Bear\nstatus\n  \nBOGUS\nDISCONNECTED\n",
            b"",
        ];
        assert_eq!(decode_chunks(&chunks), expected());
    }

    #[test]
    fn partial_line_at_eof_is_dropped() {
        assert_eq!(decode_chunks(&[&b"PING\nROL"[..]]), vec![Command::Ping]);
    }

    #[test]
    fn oversized_line_is_skipped_until_newline() {
        let long = vec![b'X'; MAX_LINE_LENGTH + 10];
        let commands = decode_chunks(&[&long[..], &b"XXX\nROLL\n"[..]]);
        assert_eq!(commands, vec![Command::Roll]);
    }

    #[test]
    fn oversized_line_is_dropped_however_it_is_chunked() {
        let mut stream = b"WIN:".to_vec();
        stream.extend(std::iter::repeat(b'X').take(300));
        stream.extend_from_slice(b"\nROLL\n");

        assert_eq!(decode_chunks(&[&stream[..]]), vec![Command::Roll]);
        for split in [1, 100, 256, 260, 290, 304, 305] {
            let (head, tail) = stream.split_at(split);
            assert_eq!(decode_chunks(&[head, tail]), vec![Command::Roll], "split at {}", split);
        }
    }

    #[test]
    fn line_at_the_length_limit_is_kept() {
        let mut stream = b"WIN:".to_vec();
        stream.extend(std::iter::repeat(b'X').take(MAX_LINE_LENGTH - 4));
        stream.push(b'\n');

        let prize = "X".repeat(MAX_LINE_LENGTH - 4);
        assert_eq!(decode_chunks(&[&stream[..]]), vec![Command::Win(Some(prize))]);
    }

    #[test]
    fn encoder_appends_newline() {
        let mut codec = LineCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(OutboundMessage::win(Some("Toy")), &mut dst).unwrap();
        codec.encode(OutboundMessage::StatusReply { ready: false }, &mut dst).unwrap();
        assert_eq!(&dst[..], b"WIN:Toy\nSTATUS:NOT_READY\n");
    }
}
