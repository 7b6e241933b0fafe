pub mod buffer;
pub mod catalog;
pub mod config;
pub mod error;
pub mod index;
pub mod storage;
pub mod transaction;
pub mod utils;
