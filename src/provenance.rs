//! Batches and their append-only journey
use chrono::Utc;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use sled::{Db, Transactional, Tree};

use crate::error::{MarketError, MarketResult};
use crate::harvest::{HarvestDetails, ProofRefs};
use crate::principal::{Principal, Role};
use crate::units::{Kg, TimeStamp};
use crate::utils::{self, or_abort, settle};

/// Ledger reference recorded when the mirror call failed or was skipped.
pub const PENDING_TX_REF: &str = "pending";

/// One harvested lot. `batch_id` and the harvest attributes never change
/// after creation; only the journey grows.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Batch {
    #[n(0)]
    pub batch_id: String,
    #[n(1)]
    pub crop_name: String,
    #[n(2)]
    pub quantity_initial: Kg,
    #[n(3)]
    pub harvest_date: TimeStamp<Utc>,
    #[n(4)]
    pub origin_location: String,
    #[n(5)]
    pub fertilizers: Vec<String>,
    #[n(6)]
    pub pesticides: Vec<String>,
    #[n(7)]
    pub proofs: ProofRefs,
    #[n(8)]
    pub metadata_hash: String, // key of the metadata document
    #[n(9)]
    pub data_hash: String, // storage reference or local fingerprint, as sent to the ledger
    #[n(10)]
    pub producer_id: String,
    #[n(11)]
    pub journey_len: u64,
    #[n(12)]
    pub created_at: TimeStamp<Utc>,
    #[n(13)]
    pub updated_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum JourneyAction {
    #[n(0)]
    Harvested,
    #[n(1)]
    Bought,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct JourneyEvent {
    #[n(0)]
    pub handler_id: String,
    #[n(1)]
    pub role: Role,
    #[n(2)]
    pub action: JourneyAction,
    #[n(3)]
    pub timestamp: TimeStamp<Utc>,
    #[n(4)]
    pub ledger_tx_ref: String,
}

/// A validated batch that has an id but is not stored yet.
#[derive(Debug, Clone)]
pub struct BatchDraft {
    pub batch_id: String,
    pub producer: Principal,
    pub proofs: ProofRefs,
    /// Defaults to the local fingerprint of the metadata document.
    pub data_hash: String,
    pub ledger_tx_ref: Option<String>,
    details: HarvestDetails,
    metadata_hash: String,
    document: Vec<u8>,
}

/// Owns every mutation of batches and their journeys.
#[derive(Clone)]
pub struct ProvenanceStore {
    pub(crate) batches: Tree,
    pub(crate) journey: Tree,
    pub(crate) metadata: Tree,
}

/// Lazy, restartable walk over a batch journey in append order.
pub struct Journey {
    inner: sled::Iter,
}

impl JourneyEvent {
    pub fn is_mirrored(&self) -> bool {
        self.ledger_tx_ref != PENDING_TX_REF
    }
}

impl JourneyAction {
    pub fn label(&self) -> &'static str {
        match self {
            JourneyAction::Harvested => "Harvested",
            JourneyAction::Bought => "Bought",
        }
    }
}

impl BatchDraft {
    /// The encoded metadata document, as uploaded to proof storage.
    pub fn document(&self) -> &[u8] {
        &self.document
    }
    pub fn details(&self) -> &HarvestDetails {
        &self.details
    }
    pub fn quantity(&self) -> Kg {
        self.details.quantity().unwrap_or_default()
    }
}

impl Iterator for Journey {
    type Item = MarketResult<JourneyEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        let value = self.inner.next()?;
        Some(
            value
                .map_err(MarketError::from)
                .and_then(|(_, bytes)| utils::decode(&bytes)),
        )
    }
}

fn journey_prefix(batch_id: &str) -> Vec<u8> {
    format!("{batch_id}/").into_bytes()
}

fn journey_key(batch_id: &str, seq: u64) -> Vec<u8> {
    let mut key = journey_prefix(batch_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

impl ProvenanceStore {
    pub fn open(db: &Db) -> MarketResult<Self> {
        Ok(Self {
            batches: db.open_tree("batches")?,
            journey: db.open_tree("journey")?,
            metadata: db.open_tree("metadata")?,
        })
    }

    /// Validate harvest metadata and assign the batch its permanent id.
    pub fn draft_batch(&self, details: HarvestDetails, producer: &Principal) -> MarketResult<BatchDraft> {
        let (metadata_hash, document) = details.validate_and_finalise()?;

        Ok(BatchDraft {
            batch_id: utils::mint_id("batch_")?,
            producer: producer.clone(),
            proofs: ProofRefs::default(),
            data_hash: utils::fingerprint(&document),
            ledger_tx_ref: None,
            details,
            metadata_hash,
            document,
        })
    }

    /// Persist a drafted batch, seeding its journey with the `Harvested` event.
    pub fn create_batch(&self, draft: &BatchDraft) -> MarketResult<Batch> {
        settle(
            (&self.batches, &self.journey, &self.metadata)
                .transaction(|(batches, journey, metadata)| Self::create_in(batches, journey, metadata, draft)),
        )
    }

    pub(crate) fn create_in(
        batches: &TransactionalTree,
        journey: &TransactionalTree,
        metadata: &TransactionalTree,
        draft: &BatchDraft,
    ) -> ConflictableTransactionResult<Batch, MarketError> {
        if batches.get(draft.batch_id.as_bytes())?.is_some() {
            return sled::transaction::abort(MarketError::Validation(format!(
                "batch {} already exists",
                draft.batch_id
            )));
        }
        let details = &draft.details;
        let now = TimeStamp::new();
        let missing = |field: &str| MarketError::Validation(format!("{field} is required"));

        let batch = Batch {
            batch_id: draft.batch_id.clone(),
            crop_name: or_abort(details.crop_name().map(str::to_string).ok_or_else(|| missing("crop name")))?,
            quantity_initial: or_abort(details.quantity().ok_or_else(|| missing("quantity")))?,
            harvest_date: or_abort(details.harvest_date().cloned().ok_or_else(|| missing("harvest date")))?,
            origin_location: or_abort(
                details
                    .origin_location()
                    .map(str::to_string)
                    .ok_or_else(|| missing("origin location")),
            )?,
            fertilizers: details.fertilizers().to_vec(),
            pesticides: details.pesticides().to_vec(),
            proofs: draft.proofs.clone(),
            metadata_hash: draft.metadata_hash.clone(),
            data_hash: draft.data_hash.clone(),
            producer_id: draft.producer.id.clone(),
            journey_len: 1,
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        let seed = JourneyEvent {
            handler_id: draft.producer.id.clone(),
            role: draft.producer.role,
            action: JourneyAction::Harvested,
            timestamp: now,
            ledger_tx_ref: draft
                .ledger_tx_ref
                .clone()
                .unwrap_or_else(|| PENDING_TX_REF.to_string()),
        };

        metadata.insert(draft.metadata_hash.as_bytes(), draft.document.clone())?;
        journey.insert(journey_key(&batch.batch_id, 0), or_abort(utils::encode(&seed))?)?;
        batches.insert(batch.batch_id.as_bytes(), or_abort(utils::encode(&batch))?)?;

        Ok(batch)
    }

    /// Append one holder change. Never skipped because the ledger mirror
    /// failed: a missing ledger reference is recorded as [`PENDING_TX_REF`].
    pub fn append_journey_event(
        &self,
        batch_id: &str,
        handler_id: &str,
        role: Role,
        action: JourneyAction,
        ledger_tx_ref: Option<&str>,
    ) -> MarketResult<JourneyEvent> {
        let event = JourneyEvent {
            handler_id: handler_id.to_string(),
            role,
            action,
            timestamp: TimeStamp::new(),
            ledger_tx_ref: ledger_tx_ref.unwrap_or(PENDING_TX_REF).to_string(),
        };

        settle(
            (&self.batches, &self.journey)
                .transaction(|(batches, journey)| Self::append_in(batches, journey, batch_id, &event)),
        )?;

        Ok(event)
    }

    pub(crate) fn append_in(
        batches: &TransactionalTree,
        journey: &TransactionalTree,
        batch_id: &str,
        event: &JourneyEvent,
    ) -> ConflictableTransactionResult<(), MarketError> {
        let Some(bytes) = batches.get(batch_id.as_bytes())? else {
            return sled::transaction::abort(MarketError::not_found("batch", batch_id));
        };
        let mut batch: Batch = or_abort(utils::decode(&bytes))?;

        journey.insert(
            journey_key(batch_id, batch.journey_len),
            or_abort(utils::encode(event))?,
        )?;
        batch.journey_len += 1;
        batch.updated_at = event.timestamp.clone();
        batches.insert(batch_id.as_bytes(), or_abort(utils::encode(&batch))?)?;

        Ok(())
    }

    pub fn find_batch(&self, batch_id: &str) -> MarketResult<Option<Batch>> {
        self.batches
            .get(batch_id.as_bytes())?
            .map(|bytes| utils::decode(&bytes))
            .transpose()
    }

    pub fn get_batch(&self, batch_id: &str) -> MarketResult<Batch> {
        self.find_batch(batch_id)?
            .ok_or_else(|| MarketError::not_found("batch", batch_id))
    }

    /// The harvest metadata document the batch was created from.
    pub fn get_metadata(&self, batch_id: &str) -> MarketResult<HarvestDetails> {
        let batch = self.get_batch(batch_id)?;
        let bytes = self
            .metadata
            .get(batch.metadata_hash.as_bytes())?
            .ok_or_else(|| MarketError::not_found("metadata document", batch.metadata_hash.clone()))?;

        utils::decode(&bytes)
    }

    pub fn get_journey(&self, batch_id: &str) -> MarketResult<Journey> {
        if !self.batches.contains_key(batch_id.as_bytes())? {
            return Err(MarketError::not_found("batch", batch_id));
        }

        Ok(Journey {
            inner: self.journey.scan_prefix(journey_prefix(batch_id)),
        })
    }
}
