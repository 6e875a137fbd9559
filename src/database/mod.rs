pub mod cache;
pub mod models;
pub mod repository;

pub use cache::RedisCache;
pub use models::*;
pub use repository::Repository;
