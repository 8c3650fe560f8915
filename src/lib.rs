pub mod config;
pub mod error;
pub mod lifecycle;
pub mod services;

pub use services::{database, ssh};

#[cfg(test)]
mod testing;
