/// Identifies a page on disk. Negative ids are sentinels, never real pages.
pub type PageId = i32;

/// Index of a frame in the buffer pool, dense in `[0, pool_size)`.
pub type FrameId = usize;
