//! Service layer API for the order workflow and traceability reads
use std::cell::Cell;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sled::Transactional;
use sled::transaction::TransactionError;
use tracing::{error, info, warn};

use crate::config::MarketConfig;
use crate::error::{CompletionStep, LedgerError, MarketError, MarketResult};
use crate::ledger::{self, LedgerMirror, LedgerOp, LedgerReceipt, LedgerRecord, MirrorOutcome};
use crate::listing::{Listing, ListingFilter, ListingStore, ListingUpdate, NewListing};
use crate::order::{Order, OrderStatus, OrderStore};
use crate::principal::Principal;
use crate::provenance::{Batch, JourneyAction, JourneyEvent, ProvenanceStore};
use crate::storage::ProofStorage;
use crate::units::{Kg, TimeStamp};
use crate::utils;

/// Whether a completion moved a whole listing or carved a child out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Whole,
    Split,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub order: Order,
    pub parent: Listing,
    pub child_listing_id: String,
    pub child: Listing,
    pub mode: TransferMode,
    pub ledger: MirrorOutcome,
}

/// A user's orders, newest first on each side.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    pub purchases: Vec<Order>,
    pub sales: Vec<Order>,
}

/// The public traceability view of a batch. Either side may be missing.
#[derive(Debug, Clone)]
pub struct BatchTrace {
    pub batch: Option<Batch>,
    pub journey: Vec<JourneyEvent>,
    pub ledger: Option<LedgerRecord>,
}

pub struct MarketService {
    pub(crate) instance: Arc<sled::Db>,
    pub(crate) provenance: ProvenanceStore,
    pub(crate) listings: ListingStore,
    pub(crate) orders: OrderStore,
    pub(crate) ledger: Arc<dyn LedgerMirror>,
    pub(crate) storage: Arc<dyn ProofStorage>,
    pub(crate) ledger_timeout: Duration,
    pub(crate) mirroring_enabled: bool,
}

impl MarketService {
    /// Collaborators are built once at start-up and shared by reference.
    pub fn new(
        instance: Arc<sled::Db>,
        ledger: Arc<dyn LedgerMirror>,
        storage: Arc<dyn ProofStorage>,
        config: &MarketConfig,
    ) -> MarketResult<Self> {
        Ok(Self {
            provenance: ProvenanceStore::open(&instance)?,
            listings: ListingStore::open(&instance)?,
            orders: OrderStore::open(&instance)?,
            instance,
            ledger,
            storage,
            ledger_timeout: config.ledger_timeout,
            mirroring_enabled: config.mirroring_enabled,
        })
    }

    pub fn provenance(&self) -> &ProvenanceStore {
        &self.provenance
    }

    pub fn listings(&self) -> &ListingStore {
        &self.listings
    }

    pub fn orders(&self) -> &OrderStore {
        &self.orders
    }

    /// Mirroring needs both the configuration switch and the ledger itself.
    /// Read once per operation.
    pub fn mirroring_enabled(&self) -> bool {
        self.mirroring_enabled && self.ledger.mirroring_enabled()
    }

    /// Flush pending writes to disk.
    pub async fn flush(&self) -> MarketResult<usize> {
        Ok(self.instance.flush_async().await?)
    }

    /// Run one ledger call under the configured deadline. Failures are
    /// logged and folded into a pending outcome, never returned.
    pub(crate) async fn mirror<F>(&self, op: LedgerOp, subject: &str, call: F) -> MirrorOutcome
    where
        F: Future<Output = Result<LedgerReceipt, LedgerError>>,
    {
        if !self.mirroring_enabled() {
            info!(%op, subject, "ledger mirroring disabled, skipping");
            return MirrorOutcome::Skipped;
        }

        match ledger::bounded(self.ledger_timeout, call).await {
            Ok(receipt) => {
                info!(%op, subject, tx_ref = %receipt.tx_ref, "ledger mirror recorded");
                MirrorOutcome::Recorded {
                    op,
                    tx_ref: receipt.tx_ref,
                }
            }
            Err(e) => {
                warn!(%op, subject, error = %e, "ledger mirror failed, continuing with pending reference");
                MirrorOutcome::Pending {
                    op,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Buyer requests a quantity from a listing. Nothing is reserved until
    /// completion, so concurrent orders may overcommit the listing.
    pub fn create_order(&self, listing_id: &str, buyer: &Principal, quantity: Kg) -> MarketResult<Order> {
        if !quantity.is_positive() {
            return Err(MarketError::Validation(format!(
                "order quantity must be positive, got {quantity}"
            )));
        }
        let listing = self.listings.get(listing_id)?;

        if listing.seller_id == buyer.id {
            return Err(MarketError::Validation("you cannot buy your own listing".into()));
        }
        if !listing.is_active {
            return Err(MarketError::InvalidState(format!(
                "listing {listing_id} is not for sale"
            )));
        }
        if quantity > listing.quantity_available {
            return Err(MarketError::InsufficientQuantity {
                listing_id: listing_id.to_string(),
                available: listing.quantity_available,
                requested: quantity,
            });
        }
        let total_price = listing.price_per_kg.times(quantity).ok_or_else(|| {
            MarketError::Validation(format!("order total overflows for {quantity}"))
        })?;

        let now = TimeStamp::new();
        let order = Order {
            order_id: utils::mint_id("order_")?,
            listing_id: listing_id.to_string(),
            buyer_id: buyer.id.clone(),
            buyer_role: buyer.role,
            seller_id: listing.seller_id.clone(),
            quantity_requested: quantity,
            total_price,
            status: OrderStatus::Pending,
            payment_ref: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.orders.insert(&order)?;

        info!(
            order_id = %order.order_id,
            listing_id,
            buyer = %order.buyer_id,
            seller = %order.seller_id,
            quantity = %quantity,
            total = %total_price,
            "order created, waiting for approval"
        );
        Ok(order)
    }

    /// Seller approves or rejects a pending order.
    pub fn set_status(&self, order_id: &str, actor: &Principal, status: OrderStatus) -> MarketResult<Order> {
        if !matches!(status, OrderStatus::Approved | OrderStatus::Rejected) {
            return Err(MarketError::Validation(format!(
                "status can only be set to approved or rejected, not {}",
                status.as_str()
            )));
        }
        let order = self.orders.get(order_id)?;

        if order.seller_id != actor.id {
            return Err(MarketError::Authorization(format!(
                "only the seller may manage order {order_id}"
            )));
        }
        if order.status != OrderStatus::Pending {
            return Err(MarketError::InvalidState(format!(
                "order {order_id} is already {}",
                order.status.as_str()
            )));
        }

        let order = self.orders.transition(order_id, status, None)?;
        info!(order_id, status = order.status.as_str(), "order status updated");
        Ok(order)
    }

    /// Settle an approved order: mirror the transfer or split to the ledger
    /// (best effort), then apply the off-chain changes as one transaction.
    pub async fn complete_order(
        &self,
        order_id: &str,
        actor: &Principal,
        payment_ref: Option<&str>,
    ) -> MarketResult<Completion> {
        let order = self.orders.get(order_id)?;

        if actor.id != order.buyer_id && actor.id != order.seller_id {
            return Err(MarketError::Authorization(format!(
                "only the buyer or seller may complete order {order_id}"
            )));
        }
        if order.status != OrderStatus::Approved {
            return Err(MarketError::InvalidState(format!(
                "order {order_id} must be approved by the seller first, it is {}",
                order.status.as_str()
            )));
        }

        let parent = self.listings.get(&order.listing_id)?;
        if parent.quantity_available < order.quantity_requested {
            return Err(MarketError::InsufficientStock {
                listing_id: parent.listing_id,
                available: parent.quantity_available,
                requested: order.quantity_requested,
            });
        }
        let mirrored = if parent.quantity_available == order.quantity_requested {
            TransferMode::Whole
        } else {
            TransferMode::Split
        };

        let batch = self.provenance.get_batch(&parent.batch_id)?;
        let child_listing_id = utils::mint_id("listing_")?;
        let buyer_ref = utils::participant_ref(order.buyer_role, &order.buyer_id);

        let outcome = match mirrored {
            TransferMode::Whole => {
                self.mirror(
                    LedgerOp::Transfer,
                    &parent.ledger_record_id,
                    self.ledger.transfer_record(&parent.ledger_record_id, &buyer_ref),
                )
                .await
            }
            TransferMode::Split => {
                self.mirror(
                    LedgerOp::Split,
                    &parent.ledger_record_id,
                    self.ledger.split_record(
                        &parent.ledger_record_id,
                        &child_listing_id,
                        order.quantity_requested,
                        &buyer_ref,
                        &batch.data_hash,
                    ),
                )
                .await
            }
        };
        let child_record_id = match mirrored {
            TransferMode::Whole => parent.ledger_record_id.clone(),
            TransferMode::Split => child_listing_id.clone(),
        };

        let (order, parent, child) =
            match self.apply_completion(&order, &parent, &child_listing_id, &child_record_id, &outcome, payment_ref) {
                Ok(applied) => applied,
                Err(e) => {
                    if outcome.is_recorded() {
                        warn!(
                            order_id,
                            batch_id = %batch.batch_id,
                            tx_ref = outcome.journey_ref(),
                            "ledger holds a transfer that was not applied off-chain, reconcile manually"
                        );
                    }
                    return Err(e);
                }
            };

        // a concurrent completion can drain the parent between the ledger
        // call and the write, turning a mirrored split into a whole transfer
        let mode = if parent.quantity_available.is_zero() {
            TransferMode::Whole
        } else {
            TransferMode::Split
        };
        if mode != mirrored && outcome.is_recorded() {
            warn!(
                order_id,
                batch_id = %batch.batch_id,
                tx_ref = outcome.journey_ref(),
                ledger_mode = ?mirrored,
                applied_mode = ?mode,
                "stock changed during completion, ledger call differs from the applied transfer"
            );
        }

        info!(
            order_id,
            batch_id = %batch.batch_id,
            parent_listing = %parent.listing_id,
            child_listing = %child.listing_id,
            remaining = %parent.quantity_available,
            tx_ref = outcome.journey_ref(),
            "order completed, ownership transferred"
        );
        Ok(Completion {
            order,
            parent,
            child_listing_id,
            child,
            mode,
            ledger: outcome,
        })
    }

    // Steps after the ledger call: mark transferred, reduce the parent,
    // append the journey event, create the buyer's child listing. All or nothing.
    fn apply_completion(
        &self,
        order: &Order,
        parent: &Listing,
        child_listing_id: &str,
        child_record_id: &str,
        outcome: &MirrorOutcome,
        payment_ref: Option<&str>,
    ) -> MarketResult<(Order, Listing, Listing)> {
        let step = Cell::new(CompletionStep::MarkTransferred);
        let event = JourneyEvent {
            handler_id: order.buyer_id.clone(),
            role: order.buyer_role,
            action: JourneyAction::Bought,
            timestamp: TimeStamp::new(),
            ledger_tx_ref: outcome.journey_ref().to_string(),
        };
        let buyer_listing = NewListing {
            batch_id: parent.batch_id.clone(),
            seller_id: order.buyer_id.clone(),
            parent_listing_id: Some(parent.listing_id.clone()),
            quantity: order.quantity_requested,
            price_per_kg: parent.price_per_kg,
            active: false,
            ledger_record_id: child_record_id.to_string(),
        };

        let applied = (
            &self.orders.tree,
            &self.listings.tree,
            &self.provenance.batches,
            &self.provenance.journey,
        )
            .transaction(|(orders, listings, batches, journey)| {
                step.set(CompletionStep::MarkTransferred);
                let order =
                    OrderStore::transition_in(orders, &order.order_id, OrderStatus::Transferred, payment_ref)?;

                step.set(CompletionStep::ReduceParent);
                let parent = ListingStore::reduce_in(listings, &order.listing_id, order.quantity_requested)?;

                step.set(CompletionStep::AppendJourney);
                ProvenanceStore::append_in(batches, journey, &parent.batch_id, &event)?;

                step.set(CompletionStep::CreateChildListing);
                let child = ListingStore::create_in(listings, child_listing_id, &buyer_listing)?;

                Ok((order, parent, child))
            });

        applied.map_err(|e| match e {
            // stock taken by a concurrent completion, nothing was applied
            TransactionError::Abort(MarketError::InsufficientQuantity {
                listing_id,
                available,
                requested,
            }) => MarketError::InsufficientStock {
                listing_id,
                available,
                requested,
            },
            // order settled concurrently
            TransactionError::Abort(e @ MarketError::InvalidState(_)) => e,
            TransactionError::Abort(e) => self.fatal(&order.order_id, step.get(), e.to_string()),
            TransactionError::Storage(e) => self.fatal(&order.order_id, step.get(), e.to_string()),
        })
    }

    fn fatal(&self, order_id: &str, step: CompletionStep, reason: String) -> MarketError {
        error!(order_id, %step, %reason, "order completion failed after the ledger step");
        MarketError::FatalCompletion {
            order_id: order_id.to_string(),
            step,
            reason,
        }
    }

    pub fn get_order(&self, order_id: &str) -> MarketResult<Order> {
        self.orders.get(order_id)
    }

    pub fn orders_for(&self, user_id: &str) -> MarketResult<OrderBook> {
        let (purchases, sales) = self.orders.split_by_party(user_id)?;
        Ok(OrderBook { purchases, sales })
    }

    pub fn get_listing(&self, listing_id: &str) -> MarketResult<Listing> {
        self.listings.get(listing_id)
    }

    /// Everything on sale plus the caller's own inventory.
    pub fn market_for(&self, viewer: &Principal) -> MarketResult<Vec<Listing>> {
        self.listings.query(&ListingFilter::VisibleTo(viewer.id.clone()))
    }

    pub fn update_listing(
        &self,
        listing_id: &str,
        actor: &Principal,
        update: ListingUpdate,
    ) -> MarketResult<Listing> {
        let listing = self.listings.update_listing(listing_id, &actor.id, update)?;
        info!(
            listing_id,
            price = %listing.price_per_kg,
            active = listing.is_active,
            "listing updated"
        );
        Ok(listing)
    }

    /// Off-chain record and journey next to whatever the ledger knows.
    /// A ledger failure only drops the ledger section.
    pub async fn trace_batch(&self, batch_id: &str) -> MarketResult<BatchTrace> {
        let batch = self.provenance.find_batch(batch_id)?;
        let journey = match batch {
            Some(_) => self
                .provenance
                .get_journey(batch_id)?
                .collect::<MarketResult<Vec<_>>>()?,
            None => Vec::new(),
        };

        let ledger = if self.mirroring_enabled() {
            match ledger::bounded(self.ledger_timeout, self.ledger.read_record(batch_id)).await {
                Ok(record) => Some(record),
                Err(e) => {
                    info!(batch_id, error = %e, "ledger read failed, returning local trace only");
                    None
                }
            }
        } else {
            None
        };

        if batch.is_none() && ledger.is_none() {
            return Err(MarketError::not_found("batch", batch_id));
        }
        Ok(BatchTrace {
            batch,
            journey,
            ledger,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::harvest::HarvestDetails;
    use crate::intake::NewHarvest;
    use crate::ledger::{InMemoryLedger, LedgerRecord};
    use crate::principal::Role;
    use crate::storage::ContentAddressedStore;
    use crate::units::Money;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Local state changes applied while the ledger is busy with a split.
    enum Interference {
        DropBatch,
        SettleOrder(String),
        DrainListing { listing_id: String, amount: Kg },
    }

    struct MeddlingLedger {
        db: Arc<sled::Db>,
        inner: InMemoryLedger,
        on_split: Mutex<Option<Interference>>,
    }

    impl MeddlingLedger {
        fn new(db: Arc<sled::Db>) -> Self {
            Self {
                db,
                inner: InMemoryLedger::new(),
                on_split: Mutex::new(None),
            }
        }

        fn during_split(&self, interference: Interference) {
            *self.on_split.lock().unwrap() = Some(interference);
        }
    }

    #[async_trait]
    impl LedgerMirror for MeddlingLedger {
        async fn create_record(
            &self,
            batch_id: &str,
            quantity: Kg,
            producer_ref: &str,
            data_hash: &str,
        ) -> Result<LedgerReceipt, LedgerError> {
            self.inner.create_record(batch_id, quantity, producer_ref, data_hash).await
        }

        async fn transfer_record(&self, batch_id: &str, to_ref: &str) -> Result<LedgerReceipt, LedgerError> {
            self.inner.transfer_record(batch_id, to_ref).await
        }

        async fn split_record(
            &self,
            parent_batch_id: &str,
            child_batch_id: &str,
            quantity: Kg,
            to_ref: &str,
            data_hash: &str,
        ) -> Result<LedgerReceipt, LedgerError> {
            let interference = self.on_split.lock().unwrap().take();
            match interference {
                Some(Interference::DropBatch) => {
                    self.db.open_tree("batches").unwrap().remove(parent_batch_id.as_bytes()).unwrap();
                }
                Some(Interference::SettleOrder(order_id)) => {
                    OrderStore::open(&self.db)
                        .unwrap()
                        .transition(&order_id, OrderStatus::Transferred, None)
                        .unwrap();
                }
                Some(Interference::DrainListing { listing_id, amount }) => {
                    ListingStore::open(&self.db)
                        .unwrap()
                        .reduce_quantity(&listing_id, amount)
                        .unwrap();
                }
                None => {}
            }
            self.inner
                .split_record(parent_batch_id, child_batch_id, quantity, to_ref, data_hash)
                .await
        }

        async fn read_record(&self, batch_id: &str) -> Result<LedgerRecord, LedgerError> {
            self.inner.read_record(batch_id).await
        }
    }

    struct Fixture {
        service: MarketService,
        ledger: Arc<MeddlingLedger>,
        farmer: Principal,
        buyer: Principal,
        listing_id: String,
        order_id: String,
    }

    // 100kg listed, 40kg ordered and approved
    async fn approved_order(dir: &std::path::Path) -> anyhow::Result<Fixture> {
        let db = Arc::new(sled::open(dir.join("service.db"))?);
        let ledger = Arc::new(MeddlingLedger::new(db.clone()));
        let service = MarketService::new(
            db,
            ledger.clone(),
            Arc::new(ContentAddressedStore::new("gateway.test")),
            &MarketConfig::default(),
        )?;
        let farmer = Principal::new("farmer-1", Role::Farmer, "Asha");
        let buyer = Principal::new("dist-1", Role::Distributor, "Ravi");

        let listed = service
            .create_batch_and_listing(
                &farmer,
                NewHarvest {
                    details: HarvestDetails::new()
                        .set_crop_name("Potato")
                        .set_quantity(Kg::from(100))
                        .set_harvest_date(TimeStamp::new())
                        .set_origin_location("Agra"),
                    price_per_kg: Money::from(10),
                    proofs: Vec::new(),
                },
            )
            .await?;
        let order = service.create_order(&listed.listing.listing_id, &buyer, Kg::from(40))?;
        service.set_status(&order.order_id, &farmer, OrderStatus::Approved)?;

        Ok(Fixture {
            service,
            ledger,
            farmer,
            buyer,
            listing_id: listed.listing.listing_id,
            order_id: order.order_id,
        })
    }

    #[tokio::test]
    async fn failed_journey_append_is_fatal_and_applies_nothing() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let f = approved_order(temp_dir.path()).await?;
        f.ledger.during_split(Interference::DropBatch);

        let err = f
            .service
            .complete_order(&f.order_id, &f.buyer, Some("upi-1"))
            .await
            .unwrap_err();

        match &err {
            MarketError::FatalCompletion { order_id, step, .. } => {
                assert_eq!(order_id, &f.order_id);
                assert_eq!(*step, CompletionStep::AppendJourney);
            }
            other => panic!("expected a fatal completion, got {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::FatalCompletion);

        let order = f.service.get_order(&f.order_id)?;
        assert_eq!(order.status, OrderStatus::Approved);
        assert_eq!(order.payment_ref, None);
        assert_eq!(f.service.get_listing(&f.listing_id)?.quantity_available, Kg::from(100));
        assert!(f.service.listings().children(&f.listing_id)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn order_settled_elsewhere_is_invalid_state() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let f = approved_order(temp_dir.path()).await?;
        f.ledger.during_split(Interference::SettleOrder(f.order_id.clone()));

        let err = f
            .service
            .complete_order(&f.order_id, &f.farmer, None)
            .await
            .unwrap_err();

        assert!(matches!(err, MarketError::InvalidState(_)));
        assert_eq!(f.service.get_listing(&f.listing_id)?.quantity_available, Kg::from(100));
        assert!(f.service.listings().children(&f.listing_id)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn drained_parent_reports_the_applied_mode() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let f = approved_order(temp_dir.path()).await?;
        f.ledger.during_split(Interference::DrainListing {
            listing_id: f.listing_id.clone(),
            amount: Kg::from(60),
        });

        let done = f.service.complete_order(&f.order_id, &f.buyer, None).await?;

        assert!(matches!(done.ledger, MirrorOutcome::Recorded { op: LedgerOp::Split, .. }));
        assert_eq!(done.mode, TransferMode::Whole);
        assert!(done.parent.quantity_available.is_zero());
        assert!(!done.parent.is_active);
        assert_eq!(done.child.quantity_available, Kg::from(40));
        Ok(())
    }

    #[tokio::test]
    async fn config_switch_overrides_a_live_ledger() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = Arc::new(sled::open(temp_dir.path().join("service.db"))?);
        let ledger = Arc::new(InMemoryLedger::new());
        let config = MarketConfig {
            mirroring_enabled: false,
            ..MarketConfig::default()
        };
        let service = MarketService::new(
            db,
            ledger.clone(),
            Arc::new(ContentAddressedStore::new("gateway.test")),
            &config,
        )?;

        assert!(ledger.mirroring_enabled());
        assert!(!service.mirroring_enabled());

        let outcome = service
            .mirror(LedgerOp::Create, "batch_x", ledger.create_record("batch_x", Kg::from(1), "FARMER_1", "h"))
            .await;
        assert_eq!(outcome, MirrorOutcome::Skipped);
        assert!(ledger.read_record("batch_x").await.is_err());
        Ok(())
    }
}
