pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LINK_LEN: usize = 2048;

/// Rows per bulk INSERT and ids per bulk DELETE.
pub const MAX_BATCH_SIZE: usize = 1_000;
pub const MAX_IN_LIST: usize = 1_000;

pub const MAX_SESSIONS_PER_DAY: usize = 10_000;
/// Professionals and locals combined.
pub const MAX_DIRECTORY_ENTRIES: usize = 100_000;

pub const MAX_SQL_LEN: usize = 64 * 1024;
