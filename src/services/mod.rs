pub mod database;
pub mod ssh;
