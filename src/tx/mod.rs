//! Transaction records, their registry and the send saga

mod channel;
mod gas;
mod nonce;
mod record;
mod registry;
mod sender;

pub use channel::{ChannelManager, TransactionChannel};
pub use gas::{GasEstimator, GasFill};
pub use record::{
    ContractContext, Params, ReceiptSummary, TransactionFailure, TransactionGroup,
    TransactionOptions, TransactionRecord, TransactionStatus, TxConfig, TxId,
};
pub use registry::{Applied, TransactionRegistry, TransactionStats};
pub use sender::TransactionSender;
