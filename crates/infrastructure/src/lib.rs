pub mod process;
pub mod store;

pub use process::OsProcessProbe;
pub use store::{connect_store, InMemoryStore, RedisStore};
