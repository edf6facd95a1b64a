//! Producer intake: harvest metadata in, batch plus root listing out
use sled::Transactional;
use tracing::{info, warn};

use crate::error::{MarketError, MarketResult};
use crate::harvest::{HarvestDetails, ProofUpload};
use crate::ledger::{LedgerOp, MirrorOutcome};
use crate::listing::{Listing, ListingStore, NewListing};
use crate::principal::{Principal, Role};
use crate::provenance::{Batch, BatchDraft, ProvenanceStore};
use crate::service::MarketService;
use crate::units::Money;
use crate::utils::{self, settle};

/// Prefix of a proof reference computed locally because storage was down.
pub const LOCAL_REF_PREFIX: &str = "local-sha256:";

/// Everything a farmer submits to list a new harvest.
#[derive(Debug, Clone)]
pub struct NewHarvest {
    pub details: HarvestDetails,
    pub price_per_kg: Money,
    /// Optional supporting documents. Missing proofs are simply absent.
    pub proofs: Vec<ProofUpload>,
}

#[derive(Debug, Clone)]
pub struct HarvestListed {
    pub batch: Batch,
    pub listing: Listing,
    pub ledger: MirrorOutcome,
    /// True when at least one object fell back to a local fingerprint.
    pub used_fallback: bool,
}

impl MarketService {
    /// Create a batch and its active root listing in one write.
    ///
    /// Proof storage and the ledger are both best effort. When storage is
    /// unreachable the affected references are local fingerprints, and the
    /// batch `data_hash` is the fingerprint of the metadata document.
    pub async fn create_batch_and_listing(
        &self,
        producer: &Principal,
        harvest: NewHarvest,
    ) -> MarketResult<HarvestListed> {
        if producer.role != Role::Farmer {
            return Err(MarketError::Authorization(format!(
                "only farmers can list a harvest, {} is a {}",
                producer.id, producer.role
            )));
        }
        if !harvest.price_per_kg.is_positive() {
            return Err(MarketError::Validation(format!(
                "price per kg must be positive, got {}",
                harvest.price_per_kg
            )));
        }

        let details = harvest
            .details
            .stamp_producer(&producer.display_name, producer.wallet_ref.as_deref());
        let mut draft = self.provenance.draft_batch(details, producer)?;
        let used_fallback = self.store_objects(&mut draft, &harvest.proofs).await;

        let producer_ref = utils::participant_ref(producer.role, &producer.id);
        let outcome = self
            .mirror(
                LedgerOp::Create,
                &draft.batch_id,
                self.ledger
                    .create_record(&draft.batch_id, draft.quantity(), &producer_ref, &draft.data_hash),
            )
            .await;
        draft.ledger_tx_ref = outcome.tx_ref().map(str::to_string);

        let listing_id = utils::mint_id("listing_")?;
        let root = NewListing {
            batch_id: draft.batch_id.clone(),
            seller_id: producer.id.clone(),
            parent_listing_id: None,
            quantity: draft.quantity(),
            price_per_kg: harvest.price_per_kg,
            active: true,
            ledger_record_id: draft.batch_id.clone(),
        };

        let written = settle(
            (
                &self.provenance.batches,
                &self.provenance.journey,
                &self.provenance.metadata,
                &self.listings.tree,
            )
                .transaction(|(batches, journey, metadata, listings)| {
                    let batch = ProvenanceStore::create_in(batches, journey, metadata, &draft)?;
                    let listing = ListingStore::create_in(listings, &listing_id, &root)?;
                    Ok((batch, listing))
                }),
        );
        let (batch, listing) = match written {
            Ok(written) => written,
            Err(e) => {
                if outcome.is_recorded() {
                    warn!(
                        batch_id = %draft.batch_id,
                        tx_ref = outcome.journey_ref(),
                        error = %e,
                        "ledger record created for a batch that was not stored, reconcile manually"
                    );
                }
                return Err(e);
            }
        };

        info!(
            batch_id = %batch.batch_id,
            listing_id = %listing.listing_id,
            crop = %batch.crop_name,
            quantity = %listing.quantity_available,
            price = %listing.price_per_kg,
            data_hash = %batch.data_hash,
            "harvest listed"
        );
        Ok(HarvestListed {
            batch,
            listing,
            ledger: outcome,
            used_fallback,
        })
    }

    // Upload proofs and the metadata document. Never fails; returns whether
    // any fallback reference was used.
    async fn store_objects(&self, draft: &mut BatchDraft, proofs: &[ProofUpload]) -> bool {
        let mut used_fallback = false;

        for proof in proofs {
            let name = format!("{}_{}_{}", proof.kind.label(), draft.batch_id, proof.name);
            let stored = self.storage.store(&proof.bytes, &name).await;
            let url = match stored {
                Ok(stored) => stored.url,
                Err(e) => {
                    warn!(batch_id = %draft.batch_id, proof = %name, error = %e, "proof upload failed, using local fingerprint");
                    used_fallback = true;
                    format!("{LOCAL_REF_PREFIX}{}", utils::fingerprint(&proof.bytes))
                }
            };
            draft.proofs.set(proof.kind, url);
        }

        let name = format!("metadata_{}.cbor", draft.batch_id);
        let stored = self.storage.store(draft.document(), &name).await;
        match stored {
            Ok(stored) => draft.data_hash = stored.reference,
            Err(e) => {
                warn!(
                    batch_id = %draft.batch_id,
                    fingerprint = %draft.data_hash,
                    error = %e,
                    "metadata upload failed, keeping local fingerprint as data hash"
                );
                used_fallback = true;
            }
        }

        used_fallback
    }
}
