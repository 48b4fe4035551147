pub mod memory;
pub mod realtime;
pub mod rest;
pub mod traits;
pub mod types;

pub use memory::MemoryBackend;
pub use rest::RestBackend;
pub use traits::Backend;
