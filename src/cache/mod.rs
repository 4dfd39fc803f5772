//! Client-side request cache with singleflight coalescing.

mod coalescer;
mod entry;

pub use coalescer::{CoalescerConfig, CoalescerStats, FetchOptions, Lookup, RequestCoalescer};
