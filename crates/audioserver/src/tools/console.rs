use bytes::BytesMut;
use std::io;
use tokio_util::codec::Decoder;

const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits tool console output on `\n` or `\r`.
///
/// ffmpeg rewrites its stats line in place with carriage returns, so a plain
/// line codec would only see it once the process exits.
#[derive(Debug, Default)]
pub struct ConsoleLineCodec;

impl ConsoleLineCodec {
    fn take_line(buf: &mut BytesMut, len: usize, consumed: usize) -> Option<String> {
        let line = buf.split_to(consumed);
        let text = String::from_utf8_lossy(&line[..len]);
        let text = text.trim_end();
        (!text.is_empty()).then(|| text.to_string())
    }
}

impl Decoder for ConsoleLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            match buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(pos) => {
                    if let Some(line) = Self::take_line(buf, pos, pos + 1) {
                        return Ok(Some(line));
                    }
                }
                None if buf.len() > MAX_LINE_BYTES => {
                    let len = buf.len();
                    return Ok(Self::take_line(buf, len, len));
                }
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        let len = buf.len();
        Ok(Self::take_line(buf, len, len))
    }
}
