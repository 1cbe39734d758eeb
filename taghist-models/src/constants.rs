/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE_NAME: &str = "taghist.toml";

/// Session id reserved for the built-in historization subscriber.
pub const HISTORY_SESSION_ID: &str = "__history__";

/// File name prefix for day shard files (`history-YYYY-MM-DD.db`).
pub const SHARD_FILE_PREFIX: &str = "history-";

/// File extension for day shard files.
pub const SHARD_FILE_EXT: &str = "db";
