pub mod config;
pub mod recordings;
pub mod sessions;

pub use config::*;
pub use recordings::*;
pub use sessions::*;
