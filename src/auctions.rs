//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                 | Description                                     | Key Methods           |
// |----------------------|-------------------------------------------------|-----------------------|
// | Auction              | Auction row as far as event handling cares      |                       |
// | AuctionStore         | Persistence operations used by event handlers   | delete_drafts         |
// | InMemoryAuctionStore | Process-local store for the worker and tests    | insert, by_author     |
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuctionStatus {
    Active,
    Draft,
    Completed,
    Canceled,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auction {
    pub id: Uuid,
    pub author: String,
    pub title: String,
    pub status: AuctionStatus,
}

impl Auction {
    pub fn new(author: &str, title: &str, status: AuctionStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            author: author.to_string(),
            title: title.to_string(),
            status,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("auction store unavailable: {0}")]
    Unavailable(String),
}

/// Both operations are idempotent; each returns the number of auctions it touched.
#[async_trait]
pub trait AuctionStore: Send + Sync {
    /// Every auction of `author` that is not a draft becomes `Deleted`
    async fn mark_deleted_except_drafts(&self, author: &str) -> Result<usize, StoreError>;

    /// Removes the draft auctions of `author`
    async fn delete_drafts(&self, author: &str) -> Result<usize, StoreError>;
}

#[derive(Default)]
pub struct InMemoryAuctionStore {
    auctions: RwLock<HashMap<Uuid, Auction>>,
}

impl InMemoryAuctionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, auction: Auction) -> Uuid {
        let id = auction.id;
        self.auctions.write().insert(id, auction);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Auction> {
        self.auctions.read().get(id).cloned()
    }

    pub fn by_author(&self, author: &str) -> Vec<Auction> {
        self.auctions
            .read()
            .values()
            .filter(|auction| auction.author == author)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.auctions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.auctions.read().is_empty()
    }
}

#[async_trait]
impl AuctionStore for InMemoryAuctionStore {
    async fn mark_deleted_except_drafts(&self, author: &str) -> Result<usize, StoreError> {
        let mut auctions = self.auctions.write();
        let mut changed = 0;
        for auction in auctions.values_mut() {
            if auction.author == author
                && !matches!(auction.status, AuctionStatus::Draft | AuctionStatus::Deleted)
            {
                auction.status = AuctionStatus::Deleted;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_drafts(&self, author: &str) -> Result<usize, StoreError> {
        let mut auctions = self.auctions.write();
        let before = auctions.len();
        auctions.retain(|_, auction| {
            !(auction.author == author && auction.status == AuctionStatus::Draft)
        });
        Ok(before - auctions.len())
    }
}
