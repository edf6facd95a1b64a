//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agri_trace::config::MarketConfig;
use agri_trace::error::LedgerError;
use agri_trace::harvest::HarvestDetails;
use agri_trace::intake::{HarvestListed, NewHarvest};
use agri_trace::ledger::{InMemoryLedger, LedgerMirror, LedgerOp, LedgerReceipt, LedgerRecord};
use agri_trace::principal::{Principal, Role};
use agri_trace::storage::{ContentAddressedStore, ProofStorage};
use agri_trace::units::{Kg, Money, TimeStamp};
use agri_trace::{MarketService, utils};
use async_trait::async_trait;

/// Wraps an [`InMemoryLedger`], failing or stalling chosen operations and
/// recording every call it was asked to make.
pub struct FlakyLedger {
    inner: InMemoryLedger,
    failing: Mutex<HashSet<LedgerOp>>,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<Vec<LedgerOp>>,
}

impl FlakyLedger {
    pub fn new() -> Self {
        Self {
            inner: InMemoryLedger::new(),
            failing: Mutex::new(HashSet::new()),
            latency: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail(&self, op: LedgerOp) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn stall(&self, delay: Duration) {
        *self.latency.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<LedgerOp> {
        self.calls.lock().unwrap().clone()
    }

    async fn gate(&self, op: LedgerOp) -> Result<(), LedgerError> {
        self.calls.lock().unwrap().push(op);
        let delay = *self.latency.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&op) {
            return Err(LedgerError::Unavailable(format!("{op} refused by test")));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerMirror for FlakyLedger {
    async fn create_record(
        &self,
        batch_id: &str,
        quantity: Kg,
        producer_ref: &str,
        data_hash: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.gate(LedgerOp::Create).await?;
        self.inner.create_record(batch_id, quantity, producer_ref, data_hash).await
    }

    async fn transfer_record(&self, batch_id: &str, to_ref: &str) -> Result<LedgerReceipt, LedgerError> {
        self.gate(LedgerOp::Transfer).await?;
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
        self.gate(LedgerOp::Split).await?;
        self.inner
            .split_record(parent_batch_id, child_batch_id, quantity, to_ref, data_hash)
            .await
    }

    async fn read_record(&self, batch_id: &str) -> Result<LedgerRecord, LedgerError> {
        self.gate(LedgerOp::Read).await?;
        self.inner.read_record(batch_id).await
    }
}

pub struct Market {
    pub service: Arc<MarketService>,
    pub ledger: Arc<FlakyLedger>,
    pub farmer: Principal,
    pub distributor: Principal,
    pub retailer: Principal,
}

/// A fresh service on its own database under `dir`.
pub fn market(dir: &Path, config: MarketConfig) -> anyhow::Result<Market> {
    let db = Arc::new(sled::open(dir.join("market.db"))?);
    let ledger = Arc::new(FlakyLedger::new());
    let storage: Arc<dyn ProofStorage> = Arc::new(ContentAddressedStore::new("gateway.test"));
    let service = MarketService::new(db, ledger.clone(), storage, &config)?;

    Ok(Market {
        service: Arc::new(service),
        ledger,
        farmer: Principal::new(utils::new_uuid_to_bech32("user_")?, Role::Farmer, "Asha Patil"),
        distributor: Principal::new(utils::new_uuid_to_bech32("user_")?, Role::Distributor, "Ravi Traders"),
        retailer: Principal::new(utils::new_uuid_to_bech32("user_")?, Role::Retailer, "Fresh Mart"),
    })
}

pub fn tomatoes(kg: u32, price: u32) -> NewHarvest {
    NewHarvest {
        details: HarvestDetails::new()
            .set_crop_name("Tomato")
            .set_quantity(Kg::from(kg))
            .set_harvest_date(TimeStamp::new())
            .set_origin_location("Nashik, Maharashtra")
            .add_fertilizer("Vermicompost")
            .add_pesticide("Neem oil"),
        price_per_kg: Money::from(price),
        proofs: Vec::new(),
    }
}

impl Market {
    pub async fn list(&self, kg: u32, price: u32) -> anyhow::Result<HarvestListed> {
        Ok(self
            .service
            .create_batch_and_listing(&self.farmer, tomatoes(kg, price))
            .await?)
    }
}
