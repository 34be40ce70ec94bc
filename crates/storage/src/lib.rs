pub mod buffer_pool;
pub mod disk;
pub mod frame;
pub mod frame_handle;
pub mod index;
pub mod page;
pub mod replacer;
pub mod typedef;

pub type Result<T> = std::result::Result<T, loamdb_error::Error>;
