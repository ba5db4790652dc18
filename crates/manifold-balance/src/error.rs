use thiserror::Error;

/// Errors raised by the load balancer
#[derive(Debug, Error)]
pub enum BalanceError {
    /// Every binding in the category is out: blacklisted, open-circuit,
    /// or at its concurrency cap. There is no cross-category fallback.
    #[error("no eligible binding for category '{category}'")]
    NoEligibleBinding {
        /// Category whose candidate set came up empty
        category: String,
    },

    /// A release arrived for a binding the balancer has never seen
    #[error("unknown binding '{binding}'")]
    UnknownBinding {
        /// The offending binding id
        binding: String,
    },
}
