// Auction service side of the event bus: configuration, event payloads,
// the auction store seam and the handlers the worker registers.
pub mod auctions;
pub mod config;
pub mod events;
pub mod handlers;

pub use auctions::{Auction, AuctionStatus, AuctionStore, InMemoryAuctionStore, StoreError};
pub use config::{Config, ConfigError};
pub use events::{BUYER_DELETION, UserDeleted, user_deleted_headers};
pub use handlers::{LoggingHandler, UserDeletedHandler};
