// A farmer lists 100kg of tomatoes, a distributor buys 40kg, and the batch is
// traced end to end. Run with `RUST_LOG=debug` for the full ledger chatter.
use std::sync::Arc;

use agri_trace::config::MarketConfig;
use agri_trace::harvest::{HarvestDetails, ProofKind, ProofUpload};
use agri_trace::intake::NewHarvest;
use agri_trace::ledger::{self, DisabledLedger, InMemoryLedger, LedgerMirror};
use agri_trace::order::OrderStatus;
use agri_trace::principal::{Principal, Role};
use agri_trace::storage::{ContentAddressedStore, ProofStorage};
use agri_trace::units::{Kg, Money, TimeStamp};
use agri_trace::{MarketService, telemetry, utils};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let config = MarketConfig::from_env()?;

    let db = Arc::new(sled::open(&config.db_path)?);
    let ledger: Arc<dyn LedgerMirror> = if config.mirroring_enabled {
        let ledger = InMemoryLedger::new();
        ledger::spawn_event_logger(ledger.subscribe());
        Arc::new(ledger)
    } else {
        Arc::new(DisabledLedger)
    };
    let storage: Arc<dyn ProofStorage> = Arc::new(ContentAddressedStore::new(config.storage_gateway.clone()));
    let service = MarketService::new(db, ledger, storage, &config)?;

    let farmer = Principal::new(utils::new_uuid_to_bech32("user_")?, Role::Farmer, "Asha Patil")
        .with_wallet("0x51f0c3a9");
    let distributor = Principal::new(utils::new_uuid_to_bech32("user_")?, Role::Distributor, "Ravi Traders");

    let listed = service
        .create_batch_and_listing(
            &farmer,
            NewHarvest {
                details: HarvestDetails::new()
                    .set_crop_name("Tomato")
                    .set_quantity(Kg::from(100))
                    .set_harvest_date(TimeStamp::new())
                    .set_origin_location("Nashik, Maharashtra")
                    .add_fertilizer("Vermicompost"),
                price_per_kg: Money::from(10),
                proofs: vec![ProofUpload {
                    kind: ProofKind::QualityCertificate,
                    name: "agmark-grade-a.pdf".into(),
                    bytes: b"AGMARK grade A".to_vec(),
                }],
            },
        )
        .await?;
    println!("listed {} as {}", listed.batch.batch_id, listed.listing.listing_id);

    let order = service.create_order(&listed.listing.listing_id, &distributor, Kg::from(40))?;
    service.set_status(&order.order_id, &farmer, OrderStatus::Approved)?;
    let done = service
        .complete_order(&order.order_id, &distributor, Some("upi-demo-001"))
        .await?;
    println!(
        "order {} {}: parent keeps {}, {} now holds {} under {}",
        done.order.order_id,
        done.order.status.as_str(),
        done.parent.quantity_available,
        distributor.display_name,
        done.child.quantity_available,
        done.child_listing_id,
    );

    let trace = service.trace_batch(&listed.batch.batch_id).await?;
    for event in &trace.journey {
        println!(
            "  {} {} by {} ({}) tx {}",
            event.timestamp,
            event.action.label(),
            event.handler_id,
            event.role,
            event.ledger_tx_ref
        );
    }
    match trace.ledger {
        Some(record) => println!("ledger holder {}, {} left on record", record.holder_ref, record.quantity),
        None => println!("ledger section unavailable"),
    }

    service.flush().await?;
    Ok(())
}
