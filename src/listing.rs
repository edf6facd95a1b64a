//! Sellable inventory and its parent/child lineage
use chrono::Utc;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use sled::{Db, Tree};

use crate::error::{MarketError, MarketResult};
use crate::units::{Kg, Money, TimeStamp};
use crate::utils::{self, or_abort, settle};

/// A sellable claim over part of a batch. Root listings have no parent;
/// every completed order adds one child owned by the buyer.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Listing {
    #[n(0)]
    pub listing_id: String,
    #[n(1)]
    pub batch_id: String,
    #[n(2)]
    pub seller_id: String,
    #[n(3)]
    pub parent_listing_id: Option<String>,
    #[n(4)]
    pub quantity_available: Kg,
    #[n(5)]
    pub price_per_kg: Money,
    #[n(6)]
    pub is_active: bool,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
    #[n(8)]
    pub updated_at: TimeStamp<Utc>,
    #[n(9)]
    pub ledger_record_id: String, // ledger record this quantity is mirrored under
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewListing {
    pub batch_id: String,
    pub seller_id: String,
    pub parent_listing_id: Option<String>,
    pub quantity: Kg,
    pub price_per_kg: Money,
    pub active: bool,
    pub ledger_record_id: String,
}

/// Seller edits. Fields left `None` are untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingUpdate {
    pub price_per_kg: Option<Money>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingFilter {
    ActiveOnly,
    OwnedBy(String),
    /// The market view of a user: everything active plus their own
    /// listings, active or not.
    VisibleTo(String),
}

#[derive(Clone)]
pub struct ListingStore {
    pub(crate) tree: Tree,
}

impl Listing {
    fn matches(&self, filter: &ListingFilter) -> bool {
        match filter {
            ListingFilter::ActiveOnly => self.is_active,
            ListingFilter::OwnedBy(user_id) => &self.seller_id == user_id,
            ListingFilter::VisibleTo(user_id) => self.is_active || &self.seller_id == user_id,
        }
    }
}

impl NewListing {
    fn validate(&self) -> MarketResult<()> {
        if self.quantity.value().is_sign_negative() {
            return Err(MarketError::Validation(format!(
                "listing quantity cannot be negative, got {}",
                self.quantity
            )));
        }
        if !self.price_per_kg.is_positive() {
            return Err(MarketError::Validation(format!(
                "price per kg must be positive, got {}",
                self.price_per_kg
            )));
        }
        if self.active && self.quantity.is_zero() {
            return Err(MarketError::Validation(
                "a listing with nothing available cannot be active".into(),
            ));
        }
        Ok(())
    }
}

impl ListingStore {
    pub fn open(db: &Db) -> MarketResult<Self> {
        Ok(Self {
            tree: db.open_tree("listings")?,
        })
    }

    pub fn create_listing(&self, new: NewListing) -> MarketResult<Listing> {
        let listing_id = utils::mint_id("listing_")?;
        settle(self.tree.transaction(|tx| Self::create_in(tx, &listing_id, &new)))
    }

    pub(crate) fn create_in(
        tx: &TransactionalTree,
        listing_id: &str,
        new: &NewListing,
    ) -> ConflictableTransactionResult<Listing, MarketError> {
        or_abort(new.validate())?;
        if tx.get(listing_id.as_bytes())?.is_some() {
            return sled::transaction::abort(MarketError::Validation(format!(
                "listing {listing_id} already exists"
            )));
        }
        let now = TimeStamp::new();
        let listing = Listing {
            listing_id: listing_id.to_string(),
            batch_id: new.batch_id.clone(),
            seller_id: new.seller_id.clone(),
            parent_listing_id: new.parent_listing_id.clone(),
            quantity_available: new.quantity,
            price_per_kg: new.price_per_kg,
            is_active: new.active,
            created_at: now.clone(),
            updated_at: now,
            ledger_record_id: new.ledger_record_id.clone(),
        };
        tx.insert(listing_id.as_bytes(), or_abort(utils::encode(&listing))?)?;

        Ok(listing)
    }

    /// Compare-and-decrement on one listing. Deactivates the listing in the
    /// same write when nothing is left.
    pub fn reduce_quantity(&self, listing_id: &str, amount: Kg) -> MarketResult<Listing> {
        settle(self.tree.transaction(|tx| Self::reduce_in(tx, listing_id, amount)))
    }

    pub(crate) fn reduce_in(
        tx: &TransactionalTree,
        listing_id: &str,
        amount: Kg,
    ) -> ConflictableTransactionResult<Listing, MarketError> {
        let mut listing = Self::load_in(tx, listing_id)?;

        if !amount.is_positive() {
            return sled::transaction::abort(MarketError::Validation(format!(
                "reduction must be positive, got {amount}"
            )));
        }
        let Some(remaining) = listing.quantity_available.checked_sub(amount) else {
            return sled::transaction::abort(MarketError::InsufficientQuantity {
                listing_id: listing_id.to_string(),
                available: listing.quantity_available,
                requested: amount,
            });
        };

        listing.quantity_available = remaining;
        if remaining.is_zero() {
            listing.is_active = false;
        }
        listing.updated_at = TimeStamp::new();
        tx.insert(listing_id.as_bytes(), or_abort(utils::encode(&listing))?)?;

        Ok(listing)
    }

    pub(crate) fn load_in(
        tx: &TransactionalTree,
        listing_id: &str,
    ) -> ConflictableTransactionResult<Listing, MarketError> {
        let Some(bytes) = tx.get(listing_id.as_bytes())? else {
            return sled::transaction::abort(MarketError::not_found("listing", listing_id));
        };

        or_abort(utils::decode(&bytes))
    }

    /// Price and activation edits, allowed only to the current seller.
    pub fn update_listing(
        &self,
        listing_id: &str,
        requestor_id: &str,
        update: ListingUpdate,
    ) -> MarketResult<Listing> {
        settle(self.tree.transaction(|tx| {
            let mut listing = Self::load_in(tx, listing_id)?;

            if listing.seller_id != requestor_id {
                return sled::transaction::abort(MarketError::Authorization(format!(
                    "only the seller may update listing {listing_id}"
                )));
            }
            if let Some(price) = update.price_per_kg {
                if !price.is_positive() {
                    return sled::transaction::abort(MarketError::Validation(format!(
                        "price per kg must be positive, got {price}"
                    )));
                }
                listing.price_per_kg = price;
            }
            if let Some(active) = update.active {
                if active && listing.quantity_available.is_zero() {
                    return sled::transaction::abort(MarketError::Validation(format!(
                        "listing {listing_id} has nothing left to sell"
                    )));
                }
                listing.is_active = active;
            }
            listing.updated_at = TimeStamp::new();
            tx.insert(listing_id.as_bytes(), or_abort(utils::encode(&listing))?)?;

            Ok(listing)
        }))
    }

    pub fn find(&self, listing_id: &str) -> MarketResult<Option<Listing>> {
        self.tree
            .get(listing_id.as_bytes())?
            .map(|bytes| utils::decode(&bytes))
            .transpose()
    }

    pub fn get(&self, listing_id: &str) -> MarketResult<Listing> {
        self.find(listing_id)?
            .ok_or_else(|| MarketError::not_found("listing", listing_id))
    }

    pub fn query(&self, filter: &ListingFilter) -> MarketResult<Vec<Listing>> {
        self.scan(|listing| listing.matches(filter))
    }

    /// Direct children, oldest first.
    pub fn children(&self, listing_id: &str) -> MarketResult<Vec<Listing>> {
        let mut children =
            self.scan(|listing| listing.parent_listing_id.as_deref() == Some(listing_id))?;
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(children)
    }

    fn scan(&self, keep: impl Fn(&Listing) -> bool) -> MarketResult<Vec<Listing>> {
        let mut found = Vec::new();
        for value in self.tree.iter().values() {
            let listing: Listing = utils::decode(&value?)?;
            if keep(&listing) {
                found.push(listing);
            }
        }
        Ok(found)
    }
}
