//! First-error-wins aggregation for teardown paths.

use std::fmt::Display;

/// Collects the results of a sequence of release operations and keeps the
/// first failure.
///
/// Each result is produced before it is handed to [`FirstError::record`], so
/// every release runs no matter what the earlier ones returned:
///
/// ```ignore
/// let mut errs = FirstError::new();
/// errs.record("dnsmasq", self.dhcp.close().await);
/// errs.record("ssh agent", self.agent.close().await);
/// errs.record("namespace", self.ns.close().await);
/// errs.finish()
/// ```
#[derive(Debug)]
pub struct FirstError<E> {
    first: Option<E>,
}

impl<E> Default for FirstError<E> {
    fn default() -> Self {
        Self { first: None }
    }
}

impl<E: Display> FirstError<E> {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of releasing `what`.
    ///
    /// Later failures are logged but do not replace an earlier one.
    pub fn record(&mut self, what: &str, result: Result<(), E>) {
        if let Err(e) = result {
            tracing::warn!("releasing {} failed: {}", what, e);
            if self.first.is_none() {
                self.first = Some(e);
            }
        }
    }

    /// Return the first recorded failure, if any.
    pub fn finish(self) -> Result<(), E> {
        match self.first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn empty_is_ok() {
        let errs: FirstError<String> = FirstError::new();
        assert!(errs.finish().is_ok());
    }

    #[test]
    fn all_destructors_run_and_first_error_is_returned() {
        let calls = Cell::new(0);
        let destroy = |n: u32, fail: bool| -> Result<(), String> {
            calls.set(calls.get() + 1);
            if fail {
                Err(format!("destructor {} failed", n))
            } else {
                Ok(())
            }
        };

        let mut errs = FirstError::new();
        errs.record("one", destroy(1, false));
        errs.record("two", destroy(2, true));
        errs.record("three", destroy(3, false));

        assert_eq!(calls.get(), 3);
        assert_eq!(errs.finish().unwrap_err(), "destructor 2 failed");
    }

    #[test]
    fn later_errors_do_not_replace_the_first() {
        let mut errs = FirstError::new();
        errs.record("a", Err("first".to_string()));
        errs.record("b", Err("second".to_string()));
        assert_eq!(errs.finish().unwrap_err(), "first");
    }
}
