use thiserror::Error;

/// Error kinds surfaced by the block, tree, revision, and merge layers.
///
/// Every variant carries enough context (a path, a hex-encoded ref, or a
/// key) to locate the offending object, per the propagation policy: I/O and
/// codec errors are wrapped with structured context and never silently
/// swallowed.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("no such path: {0}")]
    NotExist(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("node in use: {0}")]
    InUse(String),

    #[error("tree is read-only")]
    ReadOnly,

    #[error("write would overflow block capacity {capacity}: requested {requested}")]
    Overflow { capacity: usize, requested: usize },

    #[error("invalid cipher key length: {0}")]
    KeyInvalid(usize),

    #[error("ciphertext too short to contain an IV: {0} bytes")]
    CiphertextCorrupt(usize),

    #[error("no codec registered for version {version} (key={key:?})")]
    NoCodec { version: u8, key: Option<String> },

    #[error("conflicting tree construction options: {0}")]
    OptionClash(String),

    #[error("no merge base between {a} and {b}")]
    NoMergeBase { a: String, b: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
