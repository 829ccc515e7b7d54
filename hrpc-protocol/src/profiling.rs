//! Per-call profiling record.
//!
//! When a client sets the profile flag in its call options, the server
//! collects named counters during handling and appends them to the success
//! response. Encoding: `u32` entry count, then per entry a UTF key and an
//! `i64` value.

use crate::error::ProtocolError;
use crate::wire;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wall-clock time spent in the handler, recorded for every profiled call.
pub const TOTAL_SERVER_TIME_MS: &str = "total_server_time_ms";

/// Ordered set of named counters collected while handling one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilingData {
    entries: Vec<(String, i64)>,
}

impl ProfilingData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, replacing any previous entry.
    pub fn record(&mut self, key: impl Into<String>, value: i64) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Adds `delta` to `key`, starting from zero if absent.
    pub fn add(&mut self, key: impl Into<String>, delta: i64) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 += delta,
            None => self.entries.push((key, delta)),
        }
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.entries.len() as u32);
        for (key, value) in &self.entries {
            wire::put_utf(buf, key)?;
            buf.put_i64(*value);
        }
        Ok(())
    }

    pub fn read_from(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        wire::ensure(buf, 4)?;
        let count = buf.get_u32() as usize;
        let mut entries = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let key = wire::get_utf(buf)?;
            let value = wire::get_i64(buf)?;
            entries.push((key, value));
        }
        Ok(Self { entries })
    }
}
