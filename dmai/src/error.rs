// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for buffer management and codec engine operations.
//!
//! The variants follow the failure classes of a hardware codec pipeline:
//! resource creation, unrecoverable codec conditions, corrupt input, short
//! destination buffers and broken ownership protocols.

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by pools, transports, parsers and the codec engines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Backing memory, an engine handle or a codec instance could not be created.
    ///
    /// Always fatal; the stream does not start.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// The hardware codec reported an unrecoverable condition.
    #[error("Hardware codec failure: {0}")]
    HardwareFatal(String),

    /// The codec flagged the current access unit as corrupt.
    ///
    /// Recoverable unless it stalls forward progress, in which case the
    /// engine escalates it to [`Error::HardwareFatal`].
    #[error("Bitstream error: {0}")]
    Bitstream(String),

    /// A destination buffer was too small for the rewritten data.
    ///
    /// Nothing was committed; the caller retries with a larger buffer.
    #[error("Insufficient capacity: {needed} bytes needed, {available} available")]
    Capacity {
        /// Bytes required to complete the operation.
        needed: usize,
        /// Bytes the destination can hold.
        available: usize,
    },

    /// A buffer ownership rule was broken (e.g. a ring region released out of order).
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A buffer without a valid data region was handed to a transport.
    #[error("Buffer has no data region")]
    NullData,

    /// A blocking wait was interrupted by a flush or shutdown.
    #[error("Interrupted")]
    Interrupted,

    /// Invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A generic error for failures without a dedicated variant.
    #[error("Other error: {0}")]
    Other(String),

    /// Failed to convert a Rust string to a C-compatible null-terminated string.
    #[error("Null string: {0}")]
    NulString(#[from] std::ffi::NulError),

    /// Failed to load or resolve symbols from the codec engine library.
    #[error("Loading library: {0}")]
    LibLoading(#[from] libloading::Error),

    /// Failed to parse a JSON configuration document.
    #[error("Json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` for errors that must abort the owning stream.
    ///
    /// Pool and transport failures are always fatal: no engine survives a
    /// corrupted use-mask.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Bitstream(_) | Error::Capacity { .. } | Error::Interrupted
        )
    }

    /// Builds an [`Error::Other`] for a poisoned mutex.
    pub(crate) fn poisoned(what: &str) -> Self {
        Error::Other(format!("{what} mutex poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classes_are_not_fatal() {
        assert!(!Error::Bitstream("corrupt slice".into()).is_fatal());
        assert!(
            !Error::Capacity {
                needed: 10,
                available: 4
            }
            .is_fatal()
        );
        assert!(!Error::Interrupted.is_fatal());

        assert!(Error::Allocation("pool".into()).is_fatal());
        assert!(Error::HardwareFatal("dsp".into()).is_fatal());
        assert!(Error::ProtocolViolation("tail".into()).is_fatal());
        assert!(Error::NullData.is_fatal());
    }

    #[test]
    fn capacity_message_names_both_sizes() {
        let msg = Error::Capacity {
            needed: 128,
            available: 64,
        }
        .to_string();
        assert!(msg.contains("128"));
        assert!(msg.contains("64"));
    }
}
