pub mod cache;
pub mod client_ip;
pub mod config;
pub mod geo;
pub mod public_ip;
pub mod update;

pub use cache::{GeoCache, MemoryCache, TaggedGeoCache};
pub use client_ip::{CandidateVec, ClientIpResolver, TrustedProxies};
pub use geo::{GeoIpLookup, GeoRecord, MmdbGeoIpLookup};
pub use update::{UpdateError, UpdatePipeline};
