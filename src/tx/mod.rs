//! Destination-side transaction handling: dispatch with nonce management and
//! gas selection, retry policy, and confirmation tracking

mod dispatcher;
mod gas;
mod nonce;
pub mod retry;
mod tracker;

#[cfg(test)]
pub use dispatcher::mint_calldata;
pub use dispatcher::{DispatchOutcome, Dispatcher, ReplaceOutcome};
pub use gas::GasEstimator;
pub use nonce::NonceManager;
pub use retry::RetryPolicy;
pub use tracker::{ConfirmationTracker, TrackOutcome};
