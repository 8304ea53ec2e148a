//! Segment Module
//!
//! Space management for the data region: free-segment acquisition with
//! inline foreground garbage collection, and the write-staging buffer pool
//! that batches, encrypts and asynchronously flushes full segments.

mod allocator;
mod buffer;

pub use allocator::SegmentAllocator;
pub use buffer::SegmentBuffer;
