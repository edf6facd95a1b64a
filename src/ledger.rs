//! Adapter over the external append-only ledger that mirrors batch events
//!
//! Every call may fail independently of local state. Callers bound each
//! call with [`bounded`] and treat any failure as recoverable: the off-chain
//! stores stay authoritative and the journey records [`PENDING_TX_REF`].
//!
//! [`PENDING_TX_REF`]: crate::provenance::PENDING_TX_REF
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::LedgerError;
use crate::provenance::PENDING_TX_REF;
use crate::units::{Kg, TimeStamp};
use crate::utils;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReceipt {
    pub tx_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Created,
    Split,
    Transferred,
    Sold,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerHistoryEntry {
    pub action: String,
    pub from_ref: String,
    pub to_ref: String,
    pub timestamp: TimeStamp<Utc>,
}

/// A record as read back from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    pub batch_id: String,
    pub parent_batch_id: Option<String>,
    pub quantity: Kg,
    pub holder_ref: String,
    pub data_hash: String, // hex of the bytes32 slot
    pub status: RecordStatus,
    pub history: Vec<LedgerHistoryEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    Create,
    Transfer,
    Split,
    Read,
}

/// What happened to the mirror step of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    Recorded { op: LedgerOp, tx_ref: String },
    /// The call failed or timed out; reconcile by hand later.
    Pending { op: LedgerOp, reason: String },
    /// Mirroring is switched off for this ledger.
    Skipped,
}

/// Events emitted by a ledger as it accepts calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    BatchCreated {
        batch_id: String,
        producer_ref: String,
        quantity: Kg,
        tx_ref: String,
    },
    BatchTransferred {
        batch_id: String,
        from_ref: String,
        to_ref: String,
        tx_ref: String,
    },
    BatchSplit {
        parent_batch_id: String,
        child_batch_id: String,
        parent_remaining: Kg,
        child_quantity: Kg,
        new_holder: String,
        tx_ref: String,
    },
}

/// The contract-call surface the core depends on.
#[async_trait]
pub trait LedgerMirror: Send + Sync {
    /// Checked once per operation; when false no call is attempted.
    fn mirroring_enabled(&self) -> bool {
        true
    }

    async fn create_record(
        &self,
        batch_id: &str,
        quantity: Kg,
        producer_ref: &str,
        data_hash: &str,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn transfer_record(&self, batch_id: &str, to_ref: &str) -> Result<LedgerReceipt, LedgerError>;

    async fn split_record(
        &self,
        parent_batch_id: &str,
        child_batch_id: &str,
        quantity: Kg,
        to_ref: &str,
        data_hash: &str,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn read_record(&self, batch_id: &str) -> Result<LedgerRecord, LedgerError>;
}

impl MirrorOutcome {
    pub fn tx_ref(&self) -> Option<&str> {
        match self {
            MirrorOutcome::Recorded { tx_ref, .. } => Some(tx_ref),
            _ => None,
        }
    }

    /// The reference written into the journey.
    pub fn journey_ref(&self) -> &str {
        self.tx_ref().unwrap_or(PENDING_TX_REF)
    }

    pub fn is_recorded(&self) -> bool {
        matches!(self, MirrorOutcome::Recorded { .. })
    }
}

impl fmt::Display for LedgerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            LedgerOp::Create => "createRecord",
            LedgerOp::Transfer => "transferRecord",
            LedgerOp::Split => "splitRecord",
            LedgerOp::Read => "readRecord",
        };
        f.write_str(op)
    }
}

/// Run a ledger call under a deadline. An elapsed deadline is a
/// [`LedgerError::Timeout`], handled like any other ledger failure.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout(limit.as_millis() as u64)),
    }
}

/// A local, append-only ledger with the same semantics as the deployed
/// contract. Used for development and tests.
pub struct InMemoryLedger {
    records: RwLock<HashMap<String, LedgerRecord>>,
    nonce: AtomicU64,
    events: broadcast::Sender<LedgerEvent>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            records: RwLock::new(HashMap::new()),
            nonce: AtomicU64::new(0),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    fn next_tx_ref(&self, op: LedgerOp, batch_id: &str) -> String {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        format!("0x{}", sha256::digest(format!("{op}:{batch_id}:{nonce}")))
    }

    fn emit(&self, event: LedgerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl LedgerMirror for InMemoryLedger {
    async fn create_record(
        &self,
        batch_id: &str,
        quantity: Kg,
        producer_ref: &str,
        data_hash: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        if !quantity.is_positive() {
            return Err(LedgerError::Rejected("quantity must be positive".into()));
        }
        let mut records = self.records.write().await;
        if records.contains_key(batch_id) {
            return Err(LedgerError::Rejected(format!("batch {batch_id} already exists")));
        }

        let tx_ref = self.next_tx_ref(LedgerOp::Create, batch_id);
        records.insert(
            batch_id.to_string(),
            LedgerRecord {
                batch_id: batch_id.to_string(),
                parent_batch_id: None,
                quantity,
                holder_ref: producer_ref.to_string(),
                data_hash: utils::to_bytes32_hex(data_hash),
                status: RecordStatus::Created,
                history: vec![LedgerHistoryEntry {
                    action: "Created".into(),
                    from_ref: String::new(),
                    to_ref: producer_ref.to_string(),
                    timestamp: TimeStamp::new(),
                }],
            },
        );
        drop(records);

        self.emit(LedgerEvent::BatchCreated {
            batch_id: batch_id.to_string(),
            producer_ref: producer_ref.to_string(),
            quantity,
            tx_ref: tx_ref.clone(),
        });
        Ok(LedgerReceipt { tx_ref })
    }

    async fn transfer_record(&self, batch_id: &str, to_ref: &str) -> Result<LedgerReceipt, LedgerError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(batch_id)
            .ok_or_else(|| LedgerError::Rejected(format!("batch {batch_id} does not exist")))?;

        let from_ref = std::mem::replace(&mut record.holder_ref, to_ref.to_string());
        record.status = RecordStatus::Transferred;
        record.history.push(LedgerHistoryEntry {
            action: "Transferred".into(),
            from_ref: from_ref.clone(),
            to_ref: to_ref.to_string(),
            timestamp: TimeStamp::new(),
        });
        let tx_ref = self.next_tx_ref(LedgerOp::Transfer, batch_id);
        drop(records);

        self.emit(LedgerEvent::BatchTransferred {
            batch_id: batch_id.to_string(),
            from_ref,
            to_ref: to_ref.to_string(),
            tx_ref: tx_ref.clone(),
        });
        Ok(LedgerReceipt { tx_ref })
    }

    async fn split_record(
        &self,
        parent_batch_id: &str,
        child_batch_id: &str,
        quantity: Kg,
        to_ref: &str,
        data_hash: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        let mut records = self.records.write().await;
        if records.contains_key(child_batch_id) {
            return Err(LedgerError::Rejected(format!("batch {child_batch_id} already exists")));
        }
        let parent = records
            .get_mut(parent_batch_id)
            .ok_or_else(|| LedgerError::Rejected(format!("batch {parent_batch_id} does not exist")))?;
        let remaining = parent
            .quantity
            .checked_sub(quantity)
            .filter(|_| quantity.is_positive())
            .ok_or_else(|| {
                LedgerError::Rejected(format!(
                    "cannot split {quantity} from {parent_batch_id} holding {}",
                    parent.quantity
                ))
            })?;

        let from_ref = parent.holder_ref.clone();
        let now = TimeStamp::new();
        parent.quantity = remaining;
        parent.status = RecordStatus::Split;
        parent.history.push(LedgerHistoryEntry {
            action: "Split".into(),
            from_ref: from_ref.clone(),
            to_ref: to_ref.to_string(),
            timestamp: now.clone(),
        });
        records.insert(
            child_batch_id.to_string(),
            LedgerRecord {
                batch_id: child_batch_id.to_string(),
                parent_batch_id: Some(parent_batch_id.to_string()),
                quantity,
                holder_ref: to_ref.to_string(),
                data_hash: utils::to_bytes32_hex(data_hash),
                status: RecordStatus::Created,
                history: vec![LedgerHistoryEntry {
                    action: "Split".into(),
                    from_ref,
                    to_ref: to_ref.to_string(),
                    timestamp: now,
                }],
            },
        );
        let tx_ref = self.next_tx_ref(LedgerOp::Split, child_batch_id);
        drop(records);

        self.emit(LedgerEvent::BatchSplit {
            parent_batch_id: parent_batch_id.to_string(),
            child_batch_id: child_batch_id.to_string(),
            parent_remaining: remaining,
            child_quantity: quantity,
            new_holder: to_ref.to_string(),
            tx_ref: tx_ref.clone(),
        });
        Ok(LedgerReceipt { tx_ref })
    }

    async fn read_record(&self, batch_id: &str) -> Result<LedgerRecord, LedgerError> {
        self.records
            .read()
            .await
            .get(batch_id)
            .cloned()
            .ok_or_else(|| LedgerError::Rejected(format!("batch {batch_id} does not exist")))
    }
}

/// A ledger with mirroring switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledLedger;

#[async_trait]
impl LedgerMirror for DisabledLedger {
    fn mirroring_enabled(&self) -> bool {
        false
    }

    async fn create_record(&self, _: &str, _: Kg, _: &str, _: &str) -> Result<LedgerReceipt, LedgerError> {
        Err(LedgerError::Unavailable("mirroring disabled".into()))
    }

    async fn transfer_record(&self, _: &str, _: &str) -> Result<LedgerReceipt, LedgerError> {
        Err(LedgerError::Unavailable("mirroring disabled".into()))
    }

    async fn split_record(&self, _: &str, _: &str, _: Kg, _: &str, _: &str) -> Result<LedgerReceipt, LedgerError> {
        Err(LedgerError::Unavailable("mirroring disabled".into()))
    }

    async fn read_record(&self, _: &str) -> Result<LedgerRecord, LedgerError> {
        Err(LedgerError::Unavailable("mirroring disabled".into()))
    }
}

/// Fire-and-forget diagnostic listener. Logs every ledger event until the
/// ledger goes away; nothing depends on it for correctness.
pub fn spawn_event_logger(mut events: broadcast::Receiver<LedgerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LedgerEvent::BatchCreated { batch_id, producer_ref, quantity, tx_ref }) => {
                    info!(%batch_id, %producer_ref, %quantity, %tx_ref, "ledger: batch created");
                }
                Ok(LedgerEvent::BatchTransferred { batch_id, from_ref, to_ref, tx_ref }) => {
                    info!(%batch_id, %from_ref, %to_ref, %tx_ref, "ledger: batch transferred");
                }
                Ok(LedgerEvent::BatchSplit {
                    parent_batch_id,
                    child_batch_id,
                    parent_remaining,
                    child_quantity,
                    new_holder,
                    tx_ref,
                }) => {
                    info!(
                        %parent_batch_id,
                        %child_batch_id,
                        %parent_remaining,
                        %child_quantity,
                        %new_holder,
                        %tx_ref,
                        "ledger: batch split"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "ledger event listener fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn split_debits_parent_and_creates_child() {
        let ledger = InMemoryLedger::new();
        ledger
            .create_record("batch_a", Kg::from(100), "FARMER_1", "QmMeta")
            .await
            .unwrap();

        ledger
            .split_record("batch_a", "listing_b", Kg::from(40), "DISTRIBUTOR_2", "QmMeta")
            .await
            .unwrap();

        let parent = ledger.read_record("batch_a").await.unwrap();
        let child = ledger.read_record("listing_b").await.unwrap();
        assert_eq!(parent.quantity, Kg::from(60));
        assert_eq!(parent.status, RecordStatus::Split);
        assert_eq!(child.quantity, Kg::from(40));
        assert_eq!(child.holder_ref, "DISTRIBUTOR_2");
        assert_eq!(child.parent_batch_id.as_deref(), Some("batch_a"));
    }

    #[tokio::test]
    async fn oversplit_is_rejected() {
        let ledger = InMemoryLedger::new();
        ledger
            .create_record("batch_a", Kg::from(10), "FARMER_1", "QmMeta")
            .await
            .unwrap();

        let err = ledger
            .split_record("batch_a", "listing_b", Kg::from(11), "RETAILER_3", "QmMeta")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
    }

    #[tokio::test]
    async fn transfer_moves_holder_and_emits_event() {
        let ledger = InMemoryLedger::new();
        let mut events = ledger.subscribe();
        ledger
            .create_record("batch_a", Kg::from(10), "FARMER_1", "QmMeta")
            .await
            .unwrap();
        ledger.transfer_record("batch_a", "RETAILER_3").await.unwrap();

        let record = ledger.read_record("batch_a").await.unwrap();
        assert_eq!(record.holder_ref, "RETAILER_3");
        assert_eq!(record.history.len(), 2);

        assert!(matches!(events.recv().await, Ok(LedgerEvent::BatchCreated { .. })));
        assert!(matches!(events.recv().await, Ok(LedgerEvent::BatchTransferred { .. })));
    }

    #[tokio::test]
    async fn bounded_call_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, LedgerError>(())
        };

        let result = bounded(Duration::from_millis(10), slow).await;
        assert_eq!(result, Err(LedgerError::Timeout(10)));
    }
}
