//! Utility functions for identifiers, hashing and serialization

use bech32::Bech32m;
use uuid7::uuid7;

use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};

use crate::error::{MarketError, MarketResult};
use crate::principal::Role;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Mint a store identifier, folding encoder failures into the market error type.
pub(crate) fn mint_id(hrp: &str) -> MarketResult<String> {
    new_uuid_to_bech32(hrp).map_err(|e| MarketError::Encoding(e.to_string()))
}

/// The identifier a participant is known by on the ledger mirror,
/// e.g. `FARMER_3k8x0q2m`.
pub fn participant_ref(role: Role, id: &str) -> String {
    let tail = id
        .char_indices()
        .rev()
        .nth(7)
        .map(|(i, _)| &id[i..])
        .unwrap_or(id);

    format!("{}_{}", role.as_str().to_uppercase(), tail)
}

/// Fixed size fingerprint of an encoded document: the first 31 hex chars of
/// its sha256, which still fits a bytes32 ledger slot.
pub fn fingerprint(contents: &[u8]) -> String {
    let mut digest = sha256::digest(contents);
    digest.truncate(31);
    digest
}

/// Left-aligned, zero padded bytes32 rendering of a reference string, hex encoded.
/// References longer than 31 bytes are cut the way the ledger contract does.
pub fn to_bytes32_hex(reference: &str) -> String {
    let mut slot = [0u8; 32];
    let bytes = reference.as_bytes();
    let len = bytes.len().min(31);
    slot[..len].copy_from_slice(&bytes[..len]);
    hex::encode(slot)
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> MarketResult<Vec<u8>> {
    Ok(minicbor::to_vec(value)?)
}

pub(crate) fn decode<T>(bytes: &[u8]) -> MarketResult<T>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

// lift a market error into a sled transaction abort
pub(crate) fn or_abort<T>(result: MarketResult<T>) -> ConflictableTransactionResult<T, MarketError> {
    result.map_err(ConflictableTransactionError::Abort)
}

pub(crate) fn settle<T>(result: Result<T, TransactionError<MarketError>>) -> MarketResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(MarketError::Storage(e)),
    }
}
