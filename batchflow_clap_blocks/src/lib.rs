//! Building blocks for [`clap`]-driven configuration of batching producers.
pub mod batching;
