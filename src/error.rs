//! shardr error types

/// shardr result type
pub type Result<T> = std::result::Result<T, Error>;

/// shardr errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Conflicting or out-of-range settings, detected at setup
    #[error("configuration error: {reason}")]
    Config {
        /// Description of what went wrong
        reason: String,
    },

    /// Partition arithmetic produced a non-exact division.
    ///
    /// Indicates the flatten/padding step was skipped or miscomputed. This is
    /// a programming error, not a runtime condition, and is never recovered.
    #[error("partition alignment violated: {reason}")]
    PartitionAlignment {
        /// The failing division
        reason: String,
    },

    /// Collective communication error
    #[error("distributed error: {reason}")]
    Distributed {
        /// Description of what went wrong
        reason: String,
    },

    /// Training/optimizer error
    #[error("training error: {reason}")]
    Training {
        /// Description of what went wrong
        reason: String,
    },

    /// Checkpoint save/load error
    #[error("checkpoint error: {reason}")]
    Checkpoint {
        /// Description of what went wrong
        reason: String,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },
}
