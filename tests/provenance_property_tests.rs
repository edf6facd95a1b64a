//! Property-based tests for the journey log and listing quantities
//!
//! Every case opens its own sled database in a temp dir, so case counts are
//! kept low.

use std::sync::Arc;

use agri_trace::config::MarketConfig;
use agri_trace::harvest::HarvestDetails;
use agri_trace::intake::NewHarvest;
use agri_trace::ledger::DisabledLedger;
use agri_trace::listing::{ListingStore, NewListing};
use agri_trace::order::OrderStatus;
use agri_trace::principal::{Principal, Role};
use agri_trace::provenance::{JourneyAction, JourneyEvent, ProvenanceStore};
use agri_trace::storage::OfflineStorage;
use agri_trace::units::{Kg, Money, TimeStamp};
use agri_trace::{MarketError, MarketResult, MarketService};
use proptest::prelude::*;
use tempfile::tempdir;

// PROPERTY TEST STRATEGIES

fn role_strategy() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::Distributor), Just(Role::Retailer), Just(Role::Consumer)]
}

/// Handlers appended after the harvest, as (id, role) pairs.
fn handlers_strategy() -> impl Strategy<Value = Vec<(String, Role)>> {
    prop::collection::vec(("[a-z]{4,10}", role_strategy()), 1..12)
}

fn harvest(kg: u32) -> HarvestDetails {
    HarvestDetails::new()
        .set_crop_name("Wheat")
        .set_quantity(Kg::from(kg))
        .set_harvest_date(TimeStamp::new())
        .set_origin_location("Indore")
}

fn snapshot(store: &ProvenanceStore, batch_id: &str) -> MarketResult<Vec<JourneyEvent>> {
    store.get_journey(batch_id)?.collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: each journey snapshot is a strict prefix of the next one
    #[test]
    fn journey_only_grows_at_the_end(handlers in handlers_strategy()) {
        let temp_dir = tempdir().unwrap();
        let db = sled::open(temp_dir.path().join("journey.db")).unwrap();
        let store = ProvenanceStore::open(&db).unwrap();
        let farmer = Principal::new("farmer-1", Role::Farmer, "Asha");
        let batch = store.create_batch(&store.draft_batch(harvest(50), &farmer).unwrap()).unwrap();

        let mut before = snapshot(&store, &batch.batch_id).unwrap();
        for (handler, role) in &handlers {
            store
                .append_journey_event(&batch.batch_id, handler, *role, JourneyAction::Bought, None)
                .unwrap();
            let after = snapshot(&store, &batch.batch_id).unwrap();

            prop_assert_eq!(after.len(), before.len() + 1);
            prop_assert_eq!(&after[..before.len()], &before[..]);
            prop_assert_eq!(&after[before.len()].handler_id, handler);
            before = after;
        }

        // reading twice gives the same answer
        prop_assert_eq!(snapshot(&store, &batch.batch_id).unwrap(), before);
    }

    /// Property: reductions never take a listing below zero, and a listing is
    /// active exactly while it has stock
    #[test]
    fn listing_quantity_never_goes_negative(
        initial in 1u32..500,
        reductions in prop::collection::vec(1u32..120, 1..20),
    ) {
        let temp_dir = tempdir().unwrap();
        let db = sled::open(temp_dir.path().join("listing.db")).unwrap();
        let store = ListingStore::open(&db).unwrap();
        let listing = store
            .create_listing(NewListing {
                batch_id: "batch_prop".into(),
                seller_id: "farmer-1".into(),
                parent_listing_id: None,
                quantity: Kg::from(initial),
                price_per_kg: Money::from(3),
                active: true,
                ledger_record_id: "batch_prop".into(),
            })
            .unwrap();

        let mut taken = Kg::ZERO;
        for amount in reductions {
            match store.reduce_quantity(&listing.listing_id, Kg::from(amount)) {
                Ok(_) => taken = taken.checked_add(Kg::from(amount)).unwrap(),
                Err(e) => {
                    let refused = matches!(e, MarketError::InsufficientQuantity { .. });
                    prop_assert!(refused, "unexpected error {:?}", e);
                }
            }
            let current = store.get(&listing.listing_id).unwrap();
            prop_assert!(current.quantity_available >= Kg::ZERO);
            prop_assert_eq!(current.is_active, current.quantity_available.is_positive());
            prop_assert_eq!(current.quantity_available.checked_add(taken), Some(Kg::from(initial)));
        }
    }

    /// Property: every completion conserves quantity between parent and child
    #[test]
    fn completions_conserve_quantity(
        initial in 1u32..300,
        requests in prop::collection::vec(1u32..80, 1..8),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("market.db")).unwrap());
        let service = MarketService::new(
            db,
            Arc::new(DisabledLedger),
            Arc::new(OfflineStorage),
            &MarketConfig::default(),
        )
        .unwrap();
        let farmer = Principal::new("farmer-1", Role::Farmer, "Asha");
        let buyer = Principal::new("shop-1", Role::Retailer, "Fresh Mart");

        let listed = runtime
            .block_on(service.create_batch_and_listing(
                &farmer,
                NewHarvest {
                    details: harvest(initial),
                    price_per_kg: Money::from(2),
                    proofs: Vec::new(),
                },
            ))
            .unwrap();
        let listing_id = listed.listing.listing_id;

        let mut children = Kg::ZERO;
        for requested in requests {
            let before = service.get_listing(&listing_id).unwrap();
            let order = match service.create_order(&listing_id, &buyer, Kg::from(requested)) {
                Ok(order) => order,
                Err(_) => continue,
            };
            service.set_status(&order.order_id, &farmer, OrderStatus::Approved).unwrap();
            let done = runtime
                .block_on(service.complete_order(&order.order_id, &buyer, None))
                .unwrap();

            prop_assert_eq!(
                done.parent.quantity_available.checked_add(done.child.quantity_available),
                Some(before.quantity_available)
            );
            children = children.checked_add(done.child.quantity_available).unwrap();
        }

        let parent = service.get_listing(&listing_id).unwrap();
        prop_assert_eq!(parent.quantity_available.checked_add(children), Some(Kg::from(initial)));
        prop_assert_eq!(service.listings().children(&listing_id).unwrap().len(),
            service.orders_for(&buyer.id).unwrap().purchases.len());
    }
}
