pub mod capture;
pub mod config;
pub mod counters;
pub mod csum;
pub mod ctx;
pub mod mbuf;
pub mod netns;
pub mod parser;
pub mod plugin;
pub mod plugins;
pub mod rpc;
pub mod test_util;
pub mod timerw;
pub mod transport;
pub mod worker;

pub use config::RuntimeConfig;
pub use ctx::ThreadCtx;
pub use worker::Worker;

// Re-export smoltcp for external tests that need matching wire types
pub use smoltcp;
