// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::time::Duration;

use crate::MIN_RESOLUTION;

/// The result type for fallible operations that use the [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur when registering timers or building a [`LoopRegistry`][crate::LoopRegistry].
///
/// Failures of user callbacks are never surfaced through this type. A panicking callback is
/// isolated by the scheduling loop that fired it, logged, and counted in
/// [`LoopRegistry::callback_faults`][crate::LoopRegistry::callback_faults].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use timerloop::{ErrorKind, LoopRegistry};
///
/// let registry = LoopRegistry::new();
/// let error = registry.new_timer(Duration::ZERO).unwrap_err();
///
/// assert!(matches!(error.kind(), ErrorKind::InvalidArgument { .. }));
/// ```
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Error(#[from] ErrorKind);

/// The kind of an [`Error`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A duration shorter than [`MIN_RESOLUTION`] was passed to a registration API.
    #[error("interval below the minimum resolution for {operation}: {duration:?} is shorter than {min:?}", min = MIN_RESOLUTION)]
    InvalidArgument {
        /// The operation that rejected the duration.
        operation: &'static str,
        /// The rejected duration.
        duration: Duration,
    },

    /// A [`Config`][crate::Config] value is out of its permitted range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl Error {
    pub(crate) const fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub(crate) const fn invalid_argument(operation: &'static str, duration: Duration) -> Self {
        Self::from_kind(ErrorKind::InvalidArgument { operation, duration })
    }

    pub(crate) fn invalid_config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::from_kind(ErrorKind::InvalidConfig(message.into()))
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// Returns `true` if a duration was rejected because it is below [`MIN_RESOLUTION`].
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self.0, ErrorKind::InvalidArgument { .. })
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Error: Send, Sync);
        static_assertions::assert_impl_all!(ErrorKind: Send, Sync, Clone);
    }

    #[test]
    fn invalid_argument_message() {
        let error = Error::invalid_argument("new_timer", Duration::ZERO);

        assert!(error.is_invalid_argument());
        assert_eq!(
            error.to_string(),
            "interval below the minimum resolution for new_timer: 0ns is shorter than 1µs"
        );
    }

    #[test]
    fn sub_resolution_message_for_positive_interval() {
        let error = Error::invalid_argument("new_ticker", Duration::from_nanos(999));

        assert_eq!(
            error.to_string(),
            "interval below the minimum resolution for new_ticker: 999ns is shorter than 1µs"
        );
    }

    #[test]
    fn invalid_config_message() {
        let error = Error::invalid_config("shard count must be at least 1");

        assert!(!error.is_invalid_argument());
        assert_eq!(error.kind(), &ErrorKind::InvalidConfig("shard count must be at least 1".into()));
        assert_eq!(error.to_string(), "invalid configuration: shard count must be at least 1");
    }
}
