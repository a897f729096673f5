//! Core domain types for the options risk bot.

pub mod market;
pub mod order;
pub mod pnl;
pub mod position;

pub use market::*;
pub use order::*;
pub use pnl::*;
pub use position::*;
