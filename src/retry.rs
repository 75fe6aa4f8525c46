//! Support utilities for [`keen_retry`]'s retry API.

use keen_retry::RetryResult;

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. This prevents us
/// from burning CPU on retries that will never succeed.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

/// Convert a [`Result`] into a [`RetryResult`], using [`IsKnownTransient`] to
/// decide which errors deserve another attempt.
pub(crate) trait IntoRetryResult<T, E> {
    /// Classify this result.
    fn into_retry_result(self) -> RetryResult<(), (), T, E>;
}

impl<T, E> IntoRetryResult<T, E> for Result<T, E>
where
    E: IsKnownTransient,
{
    fn into_retry_result(self) -> RetryResult<(), (), T, E> {
        match self {
            Ok(output) => retry_result_ok(output),
            Err(error) if error.is_known_transient() => {
                RetryResult::Transient { input: (), error }
            }
            Err(error) => RetryResult::Fatal { input: (), error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Flaky(bool);

    impl IsKnownTransient for Flaky {
        fn is_known_transient(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn classifies_results() {
        let ok: Result<u8, Flaky> = Ok(1);
        assert!(matches!(
            ok.into_retry_result(),
            RetryResult::Ok { output: 1, .. }
        ));
        let transient: Result<u8, Flaky> = Err(Flaky(true));
        assert!(matches!(
            transient.into_retry_result(),
            RetryResult::Transient { .. }
        ));
        let fatal: Result<u8, Flaky> = Err(Flaky(false));
        assert!(matches!(
            fatal.into_retry_result(),
            RetryResult::Fatal { .. }
        ));
    }
}
