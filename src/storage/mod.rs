pub mod kv;
pub mod snapshot;
pub mod stream;
