pub mod anchors;
pub mod client;
pub mod codec;
pub mod submitter;

pub use anchors::AnchorBook;
pub use client::{LedgerReader, TransactionSubmitter, VstorageClient};
pub use codec::Passable;
pub use submitter::{CliConfig, CliSubmitter};

/// vstorage path of a feed's latest price quote
pub fn price_path(feed: &str) -> String {
    format!("published.priceFeed.{}_price_feed", feed)
}

/// vstorage path of a feed's latest round
pub fn round_path(feed: &str) -> String {
    format!("published.priceFeed.{}_price_feed.latestRound", feed)
}

/// vstorage path of an account's smart-wallet updates
pub fn wallet_path(account: &str) -> String {
    format!("published.wallet.{}", account)
}
