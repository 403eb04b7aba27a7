pub mod cancel;
pub mod keepalive;
pub mod orchestrator;


pub use cancel::CancelToken;
pub use keepalive::{ConnectionKeepalive, KeepaliveHandle};
pub use orchestrator::{SyncOutcome, WalletHistoryService};
