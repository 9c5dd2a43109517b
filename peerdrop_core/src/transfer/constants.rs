/// Size of one binary chunk on the data channel (16 KiB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Pause sending while more than this many bytes are buffered (4 MiB)
pub const HIGH_WATER_MARK: usize = 4 * 1024 * 1024;

/// Resume sending once the buffer has drained to this level (2 MiB)
pub const LOW_WATER_MARK: usize = HIGH_WATER_MARK / 2;

/// Received files are reassembled in memory, so their size is capped (2 GiB)
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Maximum length of a file name in bytes
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Report progress every this many chunks (1 MiB)
pub const PROGRESS_INTERVAL_CHUNKS: u64 = 64;
