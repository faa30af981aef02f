pub mod backend;
pub mod cookies;

// Re-export common types
pub use backend::{create_backend, CookieBackend, MemoryBackend, RedisBackend};
pub use cookies::{CookieCache, CookieRecord, CookieSweep};
