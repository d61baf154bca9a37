use solana_program::pubkey::Pubkey;
use thiserror::Error;

/// Everything that can go wrong between the ledger and the caller.
///
/// `Clone` is load-bearing: a deduplicated fetch shares one future among
/// every waiter, and each of them receives its own copy of the terminal
/// error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LarderError {
    /// Raw bytes do not match any known fixed-length schema. Local only,
    /// never surfaced to the remote.
    #[error("account bytes do not match any known record layout")]
    MalformedRecord,

    /// The remote read returned no account at this address.
    #[error("account {0} not found")]
    AccountNotFound(Pubkey),

    /// No dex market covering the requested mint pair is cached.
    #[error("no dex market found for the requested pair")]
    DexMarketNotFound,

    /// A generic query hit an address nothing has registered a parser for.
    #[error("no parser registered for account {0}")]
    NoParserRegistered(Pubkey),

    /// The wallet refused to sign. Benign cancellation, not a failure toast.
    #[error("signature declined by wallet")]
    SignatureDeclined,

    /// The remote rejected the transaction.
    #[error("transaction {signature} failed: {reason}")]
    SubmissionFailed { signature: String, reason: String },

    /// Confirmation did not arrive inside the deadline. The signature is
    /// surfaced so the caller can inspect the transaction externally.
    #[error("transaction {signature} not confirmed in time")]
    ConfirmationTimeout { signature: String },

    /// The remote read itself failed (transport, rate limit, ...).
    #[error("fetch of {address} failed: {reason}")]
    FetchFailed { address: Pubkey, reason: String },

    /// Instruction payload with an unknown tag or truncated fields.
    #[error("invalid instruction data")]
    InvalidInstruction,

    /// Checked fixed-point arithmetic overflowed or divided by zero.
    #[error("math overflow")]
    MathOverflow,

    /// The wallet holds no token account for this mint (or none with a
    /// sufficient balance).
    #[error("no token account for mint {mint}")]
    TokenAccountNotFound { mint: Pubkey },
}

impl From<solana_sdk::signer::SignerError> for LarderError {
    fn from(_: solana_sdk::signer::SignerError) -> Self {
        LarderError::SignatureDeclined
    }
}
