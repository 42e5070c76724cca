//! Roger audio output
//!
//! Audio output buffering and scheduling: a feeder thread for devices that are
//! pushed data, a lock-free state machine for devices that pull data from a
//! real-time callback, and the latency/underrun accounting shared by both.

pub mod audio;
pub mod decode;
pub mod driver;
pub mod engine;
pub mod output;
