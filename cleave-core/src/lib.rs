//! # Cleave Core
//!
//! Container demultiplexing and packet dispatch engine: one producer thread
//! splits a container into elementary streams, normalizes timestamps into a
//! 100 ns presentation domain, and feeds per-stream consumer threads under
//! backpressure and seek/flush coordination. Host integration happens
//! through the `Source` and `DeliveryTarget` collaborator traits.

// ============================================================================
// Data Model
// ============================================================================
pub mod packet;
pub mod queue;

// ============================================================================
// Pipeline
// ============================================================================
pub mod catalog;
pub mod channel;
pub mod engine;

// ============================================================================
// Collaborator Interfaces
// ============================================================================
pub mod delivery;
pub mod source;

// ============================================================================
// Configuration / Errors
// ============================================================================
pub mod config;
pub mod error;

pub use catalog::StreamCatalog;
pub use channel::{ChannelState, ChannelStats, OutputChannel};
pub use config::{ContainerProfile, EngineConfig};
pub use delivery::{DeliveryError, DeliveryTarget, SampleBuffer, SampleFlags, SampleTiming};
pub use engine::{DemuxEngine, EngineStats};
pub use error::EngineError;
pub use packet::{MediaType, Packet, SideDataKind, StreamKind, Ticks, INVALID_TIME};
pub use source::{RawPacket, Rational, ReadOutcome, Source, SourceError, StreamDescriptor};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
