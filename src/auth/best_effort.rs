//! Secondary writes whose failure must not fail the primary operation.

use std::fmt::Display;

pub trait BestEffort {
    /// Log a failure at warn level and discard it.
    fn best_effort(self, action: &'static str);
}

impl<T, E: Display> BestEffort for Result<T, E> {
    fn best_effort(self, action: &'static str) {
        if let Err(e) = self {
            tracing::warn!(action, error = %e, "best-effort operation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::error::StoreError;

    #[test]
    fn failures_are_swallowed() {
        let failed: Result<(), StoreError> = Err(StoreError::Unavailable("down".into()));
        failed.best_effort("touch_session");
        Ok::<_, StoreError>(3).best_effort("count");
    }
}
