//! Bulk sample transfer
//!
//! A fetching client allocates a `BulkRegion` sized for the samples it wants
//! and sends only its `BulkDescriptor` with the request. The provider packs
//! the trailing window into a pooled scratch buffer and pushes it to the
//! region in a single `BULK` frame ahead of the reply, so samples never
//! travel inside the reply body.
//!
//! Samples are packed as 24 little-endian bytes: `time: f64`,
//! `value: f64`, `writer: u64`.

use crate::error::{MonError, Result};
use crate::metrics::Sample;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// What the client tells the provider about its receive region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkDescriptor {
    pub region_id: u64,
    /// Capacity of the region in bytes
    pub len: u64,
}

impl BulkDescriptor {
    /// Number of whole samples the region can hold
    pub fn sample_capacity(&self) -> usize {
        (self.len as usize) / Sample::WIRE_SIZE
    }
}

/// A provider-to-client push addressed to one region
#[derive(Debug, Clone, PartialEq)]
pub struct BulkPush {
    pub region_id: u64,
    pub payload: Bytes,
}

/// Client-side receive region for one fetch
#[derive(Debug)]
pub struct BulkRegion {
    id: u64,
    capacity: usize,
    data: BytesMut,
}

impl BulkRegion {
    /// Region able to hold `count` samples
    pub fn for_samples(count: usize) -> Result<Self> {
        let capacity = count
            .checked_mul(Sample::WIRE_SIZE)
            .ok_or_else(|| MonError::InvalidArgs(format!("{} samples overflows a region", count)))?;
        let mut data: Vec<u8> = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|e| MonError::Allocation(format!("bulk region of {} bytes: {}", capacity, e)))?;
        Ok(BulkRegion {
            id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            data: BytesMut::from(Bytes::from(data)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn descriptor(&self) -> BulkDescriptor {
        BulkDescriptor {
            region_id: self.id,
            len: self.capacity as u64,
        }
    }

    /// Copy a push into the region. Rejects pushes for another region or
    /// larger than the region.
    pub fn accept(&mut self, push: &BulkPush) -> Result<()> {
        if push.region_id != self.id {
            return Err(MonError::transport(format!(
                "bulk push for region {} delivered to region {}",
                push.region_id, self.id
            )));
        }
        if push.payload.len() > self.capacity {
            return Err(MonError::transport(format!(
                "bulk push of {} bytes exceeds region of {} bytes",
                push.payload.len(),
                self.capacity
            )));
        }
        self.data.clear();
        self.data.extend_from_slice(&push.payload);
        Ok(())
    }

    pub fn filled(&self) -> usize {
        self.data.len()
    }

    /// Decode the first `count` samples written into the region
    pub fn samples(&self, count: usize) -> Result<Vec<Sample>> {
        let needed = count * Sample::WIRE_SIZE;
        if needed > self.data.len() {
            return Err(MonError::transport(format!(
                "reply announced {} samples but region holds {} bytes",
                count,
                self.data.len()
            )));
        }
        decode_samples(&self.data[..needed])
    }
}

pub fn encode_samples(samples: &[Sample], out: &mut BytesMut) {
    out.reserve(samples.len() * Sample::WIRE_SIZE);
    for s in samples {
        out.put_f64_le(s.time);
        out.put_f64_le(s.value);
        out.put_u64_le(s.writer);
    }
}

pub fn decode_samples(mut data: &[u8]) -> Result<Vec<Sample>> {
    if data.len() % Sample::WIRE_SIZE != 0 {
        return Err(MonError::transport(format!(
            "{} bytes is not a whole number of samples",
            data.len()
        )));
    }
    let mut samples = Vec::with_capacity(data.len() / Sample::WIRE_SIZE);
    while data.has_remaining() {
        let time = data.get_f64_le();
        let value = data.get_f64_le();
        let writer = data.get_u64_le();
        samples.push(Sample::new(time, value, writer));
    }
    Ok(samples)
}

/// Pool of scratch buffers for packing fetch windows
pub struct ScratchPool {
    pool: ArrayQueue<BytesMut>,
    capacity: usize,
}

impl ScratchPool {
    pub fn new(size: usize, buffer_capacity: usize) -> Self {
        let pool = ArrayQueue::new(size.max(1));
        for _ in 0..size {
            let _ = pool.push(BytesMut::with_capacity(buffer_capacity));
        }
        ScratchPool { pool, capacity: buffer_capacity }
    }

    pub fn acquire(&self) -> BytesMut {
        self.pool.pop().unwrap_or_else(|| BytesMut::with_capacity(self.capacity))
    }

    /// Return a buffer; oversized buffers are dropped rather than pooled
    pub fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > self.capacity * 4 {
            return;
        }
        buf.clear();
        let _ = self.pool.push(buf);
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        // 4096 samples per buffer
        Self::new(64, 4096 * Sample::WIRE_SIZE)
    }
}
