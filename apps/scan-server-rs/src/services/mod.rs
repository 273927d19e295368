pub mod fema;
pub mod flags;
pub mod http_cache;
pub mod landsat;
pub mod naip;
pub mod naip_history;
pub mod passes;
pub mod planet;
pub mod scoring;
pub mod sentinel;
pub mod trends;
pub mod usps;
