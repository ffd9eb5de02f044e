//! Reading source shim (§4.9): a TCP client for the distance-source wire
//! protocol (§6) — handshake once connected, then a stream of parsed
//! `Reading`s out of an otherwise raw byte stream.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use lat_types::Reading;

use crate::clock::Clock;

pub struct ReadingSource {
    stream: TcpStream,
    buffer: String,
    clock: Clock,
}

impl ReadingSource {
    /// Connect and perform the `INIT`/`START`/`MODE 0` handshake (§6).
    /// Every reading parsed off this connection is stamped through `clock`
    /// (C2) rather than the wall clock, so a live run stays replayable.
    pub async fn connect(addr: &str, anchor_ids: &[u32], clock: Clock) -> std::io::Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let anchors = anchor_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        stream
            .write_all(format!("INIT {} {}\r\n", anchor_ids.len(), anchors).as_bytes())
            .await?;
        stream.write_all(b"START\r\n").await?;
        stream.write_all(b"MODE 0\r\n").await?;
        Ok(Self {
            stream,
            buffer: String::new(),
            clock,
        })
    }

    /// Read up to one 1024-byte chunk and return every complete measurement
    /// line it produced (combined with any partial line left over from the
    /// previous read), discarding lines that fail to parse or carry a
    /// non-zero error code (§7, transient source error). `None` means the
    /// peer closed the connection (a zero-length read, §5).
    pub async fn poll(&mut self) -> std::io::Result<Option<Vec<Reading>>> {
        let mut chunk = [0u8; 1024];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        self.buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));

        let mut readings = Vec::new();
        while let Some(idx) = self.buffer.find('\n') {
            let line = self.buffer[..idx].to_string();
            self.buffer.drain(..=idx);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match Reading::parse_line(trimmed, self.clock.now()) {
                Ok(reading) if reading.is_error() => {
                    tracing::warn!(tag_id = reading.tag_id, anchor_id = reading.anchor_id, "reading reported error code, discarding");
                }
                Ok(reading) => readings.push(reading),
                Err(err) => tracing::warn!(%err, "malformed reading line, discarding"),
            }
        }
        Ok(Some(readings))
    }
}

#[cfg(test)]
mod tests {
    use lat_types::Reading;

    #[test]
    fn error_coded_reading_is_identifiable() {
        let r = Reading::parse_line("#0001.00:001:001:003", 0.0).unwrap();
        assert!(r.is_error());
    }
}
