//! HTTP layer for the caching forward proxy.
//!
//! Every inbound path is treated as a target URL.  Requests are classified as
//! plain traffic, git smart-HTTP traffic or repository clones, and served
//! from the on-disk cache, forwarded upstream, or packaged as an archive.

pub mod classify;
pub mod clone;
pub mod handler;
pub mod proxy;
