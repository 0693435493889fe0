pub mod app;
pub mod chat;
pub mod error;
pub mod models;
pub mod platform;
pub mod templates;

pub use error::{Error, Result};
