pub mod classify;
pub mod cli;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod pipeline;
pub mod status;
pub mod storage;
pub mod table;
pub mod util;
pub mod validate;
