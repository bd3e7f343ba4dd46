pub mod aggregate;
pub mod checkpoint;
pub mod compressor;
pub mod config;
pub mod env;
pub mod error;
pub mod experiment;
pub mod fitness;
pub mod network;
pub mod optimizer;
pub mod resize;
pub mod rollout;
pub mod sampler;
