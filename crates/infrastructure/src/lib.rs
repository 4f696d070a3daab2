//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod in_memory_coordination_backend;
mod redis_coordination_backend;
mod telegram_bot_api;

pub use in_memory_coordination_backend::InMemoryCoordinationBackend;
pub use redis_coordination_backend::RedisCoordinationBackend;
pub use telegram_bot_api::{TelegramBotApi, TelegramBotApiConfig};
