pub mod auth;

pub use auth::{check_worker_api_key, worker_key_middleware};
