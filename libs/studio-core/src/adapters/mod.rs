// Declare modules within the adapters directory
pub mod in_memory_cache;
pub mod in_memory_database;
pub mod in_memory_event_bus;
pub mod postgres_database;
pub mod redis_cache;
pub mod redis_event_bus;

pub use in_memory_cache::InMemoryCache;
pub use in_memory_database::{InMemoryConnector, InMemoryDatabase};
pub use in_memory_event_bus::InMemoryEventBus;
pub use postgres_database::{PostgresConnector, PostgresDatabase};
pub use redis_cache::RedisCache;
pub use redis_event_bus::RedisEventBus;
