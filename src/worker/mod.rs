pub mod consumer;
pub mod handler;
pub mod pool;
