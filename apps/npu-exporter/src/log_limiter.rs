// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Deduplicating writer in front of the rotating log sink.
//!
//! A repeated failure (a flapping SDK call, a rejected client hammering the
//! endpoint) would otherwise fill the log with identical lines. Writes are
//! keyed on their content past the fixed timestamp prefix; a key seen
//! within the TTL is dropped before it reaches the sink.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ascend_cache::ShardedCache;
use tracing_subscriber::fmt::MakeWriter;

/// Length of the timestamp prefix our log format emits; the prefix differs
/// on every line and must not participate in the dedup key.
const TIMESTAMP_PREFIX_LEN: usize = 46;

pub const MAX_CACHE_SIZE: usize = 102_400;
pub const MAX_EXPIRY_SECS: u64 = 3_600;

pub struct LogLimiter<W> {
    sink: Mutex<W>,
    seen: Option<ShardedCache<i64>>,
    ttl: Duration,
}

impl<W: Write> LogLimiter<W> {
    /// `cache_size` of 0 or `expiry` of 0 disables deduplication. Values
    /// outside the supported bounds fall back to the bounds.
    pub fn new(sink: W, cache_size: usize, expiry_secs: u64) -> Self {
        let cache_size = cache_size.min(MAX_CACHE_SIZE);
        let expiry_secs = expiry_secs.min(MAX_EXPIRY_SECS);
        let seen = (cache_size > 0 && expiry_secs > 0).then(|| ShardedCache::new(cache_size));
        LogLimiter {
            sink: Mutex::new(sink),
            seen,
            ttl: Duration::from_secs(expiry_secs),
        }
    }

    fn dedup_key(line: &[u8]) -> &[u8] {
        if line.len() > TIMESTAMP_PREFIX_LEN {
            &line[TIMESTAMP_PREFIX_LEN..]
        } else {
            line
        }
    }
}

impl<W: Write> Write for &LogLimiter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(seen) = &self.seen {
            let key = String::from_utf8_lossy(LogLimiter::<W>::dedup_key(buf));
            match seen.set_if_absent(&key, 1, Some(self.ttl)) {
                Ok(true) => {}
                // a duplicate within the window, or an unusable TTL:
                // swallow the line but report it written
                _ => return Ok(buf.len()),
            }
        }
        let mut sink = match self.sink.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        sink.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut sink = match self.sink.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        sink.flush()
    }
}

/// `MakeWriter` adapter so the limiter can front the fmt layer's sink.
#[derive(Clone)]
pub struct LimitedWriter<W>(pub Arc<LogLimiter<W>>);

impl<'a, W: Write + 'static> MakeWriter<'a> for LimitedWriter<W> {
    type Writer = &'a LogLimiter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn line(body: &str) -> Vec<u8> {
        // fixed-width fake timestamp prefix followed by the payload
        let mut line = format!("{:<width$}", "2024-05-01T10:00:00.000000Z", width = TIMESTAMP_PREFIX_LEN)
            .into_bytes();
        line.extend_from_slice(body.as_bytes());
        line
    }

    #[test]
    fn duplicate_lines_within_ttl_are_dropped() {
        let buf = SharedBuf::default();
        let limiter = LogLimiter::new(buf.clone(), 1024, 60);
        let mut w = &limiter;
        w.write_all(&line("sdk call failed")).unwrap();
        w.write_all(&line("sdk call failed")).unwrap();
        w.write_all(&line("another message")).unwrap();
        let written = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(written.matches("sdk call failed").count(), 1);
        assert_eq!(written.matches("another message").count(), 1);
    }

    #[test]
    fn distinct_timestamps_same_body_still_deduped() {
        let buf = SharedBuf::default();
        let limiter = LogLimiter::new(buf.clone(), 1024, 60);
        let mut w = &limiter;
        let mut a = format!("{:<width$}", "t1", width = TIMESTAMP_PREFIX_LEN).into_bytes();
        a.extend_from_slice(b"same body");
        let mut b = format!("{:<width$}", "t2", width = TIMESTAMP_PREFIX_LEN).into_bytes();
        b.extend_from_slice(b"same body");
        w.write_all(&a).unwrap();
        w.write_all(&b).unwrap();
        let written = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(written.matches("same body").count(), 1);
    }

    #[test]
    fn zero_expiry_disables_dedup() {
        let buf = SharedBuf::default();
        let limiter = LogLimiter::new(buf.clone(), 1024, 0);
        let mut w = &limiter;
        w.write_all(&line("repeat")).unwrap();
        w.write_all(&line("repeat")).unwrap();
        let written = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(written.matches("repeat").count(), 2);
    }
}
