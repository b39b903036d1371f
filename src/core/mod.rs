pub mod cache;
pub mod chat_stream;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod frames;
pub mod normalizer;
pub mod relay;
pub mod request;
pub mod retry;
