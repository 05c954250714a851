pub mod config;
pub mod curriculum;
pub mod db;
pub mod encoding;
pub mod error;
pub mod history;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod reconcile;
pub mod report;
pub mod store;
pub mod translate;
pub mod writer;

pub use error::{Error, Result};
