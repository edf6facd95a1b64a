//! Harvest metadata drafted by a producer before a batch is listed
use crate::error::{MarketError, MarketResult};
use crate::units::{Kg, TimeStamp};
use chrono::Utc;

/// The immutable metadata document of a batch.
///
/// Built as a draft with the setters below, then frozen by
/// [`HarvestDetails::validate_and_finalise`], which yields the sha256 of the
/// CBOR document alongside the document itself.
///
/// Defaults: `fertilizers` and `pesticides` are empty when never set,
/// `producer_name`/`producer_wallet` are stamped by intake from the caller.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, Eq, PartialEq)]
pub struct HarvestDetails {
    #[n(0)]
    crop_name: Option<String>,
    #[n(1)]
    quantity_initial: Option<Kg>,
    #[n(2)]
    harvest_date: Option<TimeStamp<Utc>>,
    #[n(3)]
    origin_location: Option<String>,
    #[n(4)]
    fertilizers: Vec<String>,
    #[n(5)]
    pesticides: Vec<String>,
    #[n(6)]
    producer_name: Option<String>,
    #[n(7)]
    producer_wallet: Option<String>,
    #[n(8)]
    drafted_at: Option<TimeStamp<Utc>>,
}

/// Which piece of supporting evidence a proof upload is.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProofKind {
    #[n(0)]
    CropImage,
    #[n(1)]
    QualityCertificate,
    #[n(2)]
    FertilizerProof,
    #[n(3)]
    PesticideProof,
    #[n(4)]
    ProofImage,
}

/// A proof document or image supplied alongside a new batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofUpload {
    pub kind: ProofKind,
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Where each proof ended up. `None` when that proof was never supplied.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, PartialEq, Eq)]
pub struct ProofRefs {
    #[n(0)]
    pub image_url: Option<String>,
    #[n(1)]
    pub quality_certificate_url: Option<String>,
    #[n(2)]
    pub fertilizer_proof_url: Option<String>,
    #[n(3)]
    pub pesticide_proof_url: Option<String>,
    #[n(4)]
    pub proof_image_url: Option<String>,
}

impl HarvestDetails {
    /// Construct a new builder object, this becomes the basis for a draft
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_crop_name(mut self, crop_name: &str) -> Self {
        self.crop_name = Some(crop_name.trim().to_string());
        self
    }
    pub fn set_quantity(mut self, quantity: Kg) -> Self {
        self.quantity_initial = Some(quantity);
        self
    }
    pub fn set_harvest_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.harvest_date = Some(date);
        self
    }
    pub fn set_origin_location(mut self, origin: &str) -> Self {
        self.origin_location = Some(origin.trim().to_string());
        self
    }
    pub fn add_fertilizer(mut self, fertilizer: &str) -> Self {
        self.fertilizers.push(fertilizer.to_string());
        self
    }
    pub fn add_pesticide(mut self, pesticide: &str) -> Self {
        self.pesticides.push(pesticide.to_string());
        self
    }
    pub(crate) fn stamp_producer(mut self, name: &str, wallet: Option<&str>) -> Self {
        self.producer_name = Some(name.to_string());
        self.producer_wallet = wallet.map(str::to_string);
        self.drafted_at = Some(TimeStamp::new());
        self
    }

    pub fn crop_name(&self) -> Option<&str> {
        self.crop_name.as_deref()
    }
    pub fn quantity(&self) -> Option<Kg> {
        self.quantity_initial
    }
    pub fn harvest_date(&self) -> Option<&TimeStamp<Utc>> {
        self.harvest_date.as_ref()
    }
    pub fn origin_location(&self) -> Option<&str> {
        self.origin_location.as_deref()
    }
    pub fn fertilizers(&self) -> &[String] {
        &self.fertilizers
    }
    pub fn pesticides(&self) -> &[String] {
        &self.pesticides
    }

    // Checks required fields. returns a hash of the document and its contents serialised into cbor
    pub fn validate_and_finalise(&self) -> MarketResult<(String, Vec<u8>)> {
        match self.crop_name.as_deref() {
            Some(name) if !name.is_empty() => {}
            _ => return Err(MarketError::Validation("crop name is required".into())),
        }
        match self.quantity_initial {
            Some(quantity) if quantity.is_positive() => {}
            Some(quantity) => {
                return Err(MarketError::Validation(format!(
                    "harvest quantity must be positive, got {quantity}"
                )));
            }
            None => return Err(MarketError::Validation("harvest quantity is required".into())),
        }
        if self.harvest_date.is_none() {
            return Err(MarketError::Validation("harvest date is required".into()));
        }
        match self.origin_location.as_deref() {
            Some(origin) if !origin.is_empty() => {}
            _ => return Err(MarketError::Validation("origin location is required".into())),
        }

        let contents = minicbor::to_vec(self)?;
        let hash = sha256::digest(&contents);

        Ok((hash, contents))
    }
}

impl ProofRefs {
    pub(crate) fn set(&mut self, kind: ProofKind, url: String) {
        let slot = match kind {
            ProofKind::CropImage => &mut self.image_url,
            ProofKind::QualityCertificate => &mut self.quality_certificate_url,
            ProofKind::FertilizerProof => &mut self.fertilizer_proof_url,
            ProofKind::PesticideProof => &mut self.pesticide_proof_url,
            ProofKind::ProofImage => &mut self.proof_image_url,
        };
        *slot = Some(url);
    }
}

impl ProofKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProofKind::CropImage => "crop_image",
            ProofKind::QualityCertificate => "quality_certificate",
            ProofKind::FertilizerProof => "fertilizer_proof",
            ProofKind::PesticideProof => "pesticide_proof",
            ProofKind::ProofImage => "proof_image",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> HarvestDetails {
        HarvestDetails::new()
            .set_crop_name("Tomato")
            .set_quantity(Kg::from(100))
            .set_harvest_date(TimeStamp::new())
            .set_origin_location("Nashik, MH")
    }

    #[test]
    fn complete_draft_finalises() {
        let details = draft();
        let (hash, cbor) = details.validate_and_finalise().unwrap();

        assert_eq!(hash.len(), 64);
        let decoded: HarvestDetails = minicbor::decode(&cbor).unwrap();
        assert_eq!(decoded, details);
    }

    #[test]
    fn missing_origin_is_rejected() {
        let details = HarvestDetails::new()
            .set_crop_name("Tomato")
            .set_quantity(Kg::from(100))
            .set_harvest_date(TimeStamp::new());

        assert!(matches!(
            details.validate_and_finalise(),
            Err(MarketError::Validation(_))
        ));
    }

    #[test]
    fn blank_crop_name_is_rejected() {
        let details = draft().set_crop_name("   ");

        assert!(details.validate_and_finalise().is_err());
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let details = draft().set_quantity(Kg::ZERO);

        assert!(details.validate_and_finalise().is_err());
    }

    #[test]
    fn quality_inputs_default_to_empty() {
        let details = draft();

        assert!(details.fertilizers().is_empty());
        assert!(details.pesticides().is_empty());
    }
}
