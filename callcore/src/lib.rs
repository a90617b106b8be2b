pub mod backoff;
pub mod net;
pub mod protocol;
pub mod sdp;
pub mod stats;
pub mod trace;
pub mod types;
