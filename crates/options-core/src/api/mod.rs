//! Clients for external market-data services.

pub mod feed;
pub mod quotes;

pub use feed::{TickSource, TickStream, WsTickSource};
pub use quotes::{HttpQuoteProvider, QuoteProvider};
