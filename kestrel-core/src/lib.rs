//! Kestrel receiver core library
//!
//! This crate holds the signal path and control plane of a multichannel
//! software-defined receiver: a fast-convolution channelizer fed by one
//! wideband front end, per-channel demodulators, and the TLV status/command
//! codec spoken on the multicast metadata plane. Hardware drivers and
//! configuration live in the `kestrel-radiod` binary; the core exposes
//! their contracts (the sample ingest sink and the channel table) as plain
//! types.

pub mod chan;
pub mod errors;
pub mod filter;
pub mod frontend;
pub mod linear;
pub mod multicast;
pub mod osc;
pub mod output;
pub mod status;
pub mod tlv;

// Re-export the high-traffic types at the crate root
pub use chan::{Chan, ChanConfig, ChannelTable, DemodKind};
pub use errors::{RadioError, Result};
pub use filter::{FilterInput, FilterOutput, FilterParams, SpectrumBus};
pub use frontend::{Frontend, Ingest};
