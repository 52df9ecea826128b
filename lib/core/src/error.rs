//! Shared `Result` alias.
//!
//! Domain errors live next to the code that raises them; each layer wraps
//! what it receives with rootcause's `.context()`.

use rootcause::Report;

/// A `Result` whose error is a rootcause [`Report`] over context `C`.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    use crate::id::{DispatchId, ParseIdError};

    #[test]
    fn result_carries_typed_context() {
        let parsed: Result<DispatchId, ParseIdError> =
            "run-42".parse::<DispatchId>().map_err(Into::into);
        let report = parsed.unwrap_err();
        assert!(report.to_string().contains("DispatchId"));
    }
}
