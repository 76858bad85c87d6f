//! Downstream delivery collaborator.
//!
//! One [`DeliveryTarget`] per output channel. In a filter-graph host this
//! adapter wraps the connected input pin and its sample allocator; in tests
//! it is a recording sink. The engine only ever talks to this trait.

use thiserror::Error;

use crate::packet::{MediaType, Ticks};

/// Sample timing in 100 ns presentation ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleTiming {
    pub start: Ticks,
    pub stop: Ticks,
}

/// Flags carried on a delivered sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    pub sync_point: bool,
    pub discontinuity: bool,
    /// Sample lies entirely before the active segment start and is decoded
    /// but not presented
    pub preroll: bool,
}

/// A host-owned delivery buffer. The channel copies packet payload into it
/// and hands it back through `deliver_sample`.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    data: Vec<u8>,
}

impl SampleBuffer {
    /// Buffer with at least `capacity` usable bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Replace buffer contents with `payload`. Fails when the buffer was
    /// acquired too small; the caller re-acquires a larger one.
    pub fn fill(&mut self, payload: &[u8]) -> Result<(), DeliveryError> {
        if self.data.capacity() < payload.len() {
            return Err(DeliveryError::BufferTooSmall {
                needed: payload.len(),
                got: self.data.capacity(),
            });
        }
        self.data.clear();
        self.data.extend_from_slice(payload);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Downstream refused the sample; terminal for the channel
    #[error("downstream rejected sample: {0}")]
    Rejected(String),

    /// Downstream does not accept the proposed format
    #[error("format not accepted: {0}")]
    FormatRejected(String),

    /// Buffer acquisition could not satisfy the requested size
    #[error("delivery buffer too small: needed {needed}, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    /// Host-side allocation failed
    #[error("delivery buffer allocation failed")]
    Allocation,
}

/// Capability interface implemented once per host adapter.
///
/// Calls arrive on the owning channel's dispatch thread, except
/// `begin_flush`/`end_flush` which arrive on the control thread while a
/// delivery may be in flight; `deliver_sample` is expected to return in
/// bounded time once a flush has begun.
pub trait DeliveryTarget: Send + Sync {
    /// Announce a format change before the first sample in the new format.
    fn set_active_media_format(&self, format: &MediaType) -> Result<(), DeliveryError>;

    /// Acquire a delivery buffer of at least `min_len` bytes.
    fn acquire_buffer(&self, min_len: usize) -> Result<SampleBuffer, DeliveryError>;

    /// Deliver one sample downstream.
    fn deliver_sample(
        &self,
        buffer: SampleBuffer,
        timing: SampleTiming,
        flags: SampleFlags,
    ) -> Result<(), DeliveryError>;

    fn deliver_end_of_stream(&self);

    fn begin_flush(&self);

    fn end_flush(&self);

    fn deliver_new_segment(&self, start: Ticks, stop: Ticks, rate: f64);
}
