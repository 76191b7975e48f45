//! Hardware-counter sampling (spec section 4.3): opens `perf_event_open(2)`
//! counters per TID/event-group, decodes their ring buffers, and hands
//! decoded samples to the router.

pub mod record;
pub mod ring_buffer;
pub mod sampler;

pub use record::Record;
pub use ring_buffer::RingBuffer;
pub use sampler::{DecodedSample, Sampler, MAX_FAILURES};
