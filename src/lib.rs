pub mod blob;
pub mod cache;
pub mod command;
pub mod config;
pub mod error;
pub mod index;
pub mod pio;
pub mod tmpfs;

pub use blob::BlobStore;
pub use cache::Cache;
pub use command::{Handler, ObjectId};
pub use config::BlobConfig;
pub use error::{Error, Result};
