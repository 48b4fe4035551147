pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod local_store;
pub mod models;
pub mod note;
pub mod services;

pub use backend::{Backend, MemoryBackend, RestBackend};
pub use config::Config;
pub use error::{Error, Result};
pub use local_store::LocalStore;
