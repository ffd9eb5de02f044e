//! Estimate sink shim (§4.9): publishes fused tag positions to the
//! downstream tracking backend, rate-limited to one publish per second per
//! tag (§6) — grounded on the source's `lat_backend.py` publisher, which
//! resets its per-tag coalescing window rather than buffering stale
//! positions forward (§9: this is intended behaviour, not a bug to fix).

use std::collections::HashMap;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::clock::Clock;

const PUBLISH_INTERVAL: f64 = 1.0;

pub struct EstimateSink {
    stream: TcpStream,
    clock: Clock,
    last_published: HashMap<u32, f64>,
}

impl EstimateSink {
    pub async fn connect(addr: &str, clock: Clock) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            stream,
            clock,
            last_published: HashMap::new(),
        })
    }

    /// Publish every (tag, position) whose rate-limit window has elapsed;
    /// tags inside their window are silently skipped, not queued.
    pub async fn publish(&mut self, locations: &HashMap<u32, (f64, f64)>) -> std::io::Result<()> {
        let now = self.clock.now();
        for (&tag_id, &(x, y)) in locations {
            if let Some(&last) = self.last_published.get(&tag_id) {
                if now - last < PUBLISH_INTERVAL {
                    continue;
                }
            }
            let line = format!("{} {:.2} {:.2}\r\n", tag_id, x, y);
            self.stream.write_all(line.as_bytes()).await?;
            self.last_published.insert(tag_id, now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_line_matches_the_published_format() {
        let line = format!("{} {:.2} {:.2}\r\n", 7u32, 1.5, -2.25);
        assert_eq!(line, "7 1.50 -2.25\r\n");
    }
}
