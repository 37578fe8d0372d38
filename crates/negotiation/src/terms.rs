//! Negotiable terms attached to an offer.

use serde::{Deserialize, Serialize};

use haggle_core::{DomainError, DomainResult, ValueObject};

pub const MAX_LEAD_TIME_DAYS: u32 = 365;
pub const MAX_WARRANTY_MONTHS: u32 = 120;
pub const MAX_NOTE_LEN: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    BankTransfer,
    Cash,
    Credit,
    Escrow,
}

/// Incoterms-style shipping responsibility split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShippingTerms {
    Exw,
    Fob,
    Cif,
    Dap,
    Ddp,
}

/// Conditions proposed alongside an offer.
///
/// Terms are replaced wholesale by every counter-offer; unset fields mean
/// "not part of this proposal", not "unchanged".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terms {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_lead_time_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_payment_percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warranty_months: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_terms: Option<ShippingTerms>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ValueObject for Terms {}

impl Terms {
    pub fn validate(&self) -> DomainResult<()> {
        if let Some(days) = self.delivery_lead_time_days {
            if days == 0 || days > MAX_LEAD_TIME_DAYS {
                return Err(DomainError::invalid_argument(format!(
                    "delivery lead time must be 1..={MAX_LEAD_TIME_DAYS} days, got {days}"
                )));
            }
        }
        if let Some(pct) = self.down_payment_percent {
            if pct > 100 {
                return Err(DomainError::invalid_argument(format!(
                    "down payment percent must be 0..=100, got {pct}"
                )));
            }
            if pct > 0 && self.payment_method.is_none() {
                return Err(DomainError::invalid_argument(
                    "down payment requires a payment method",
                ));
            }
        }
        if let Some(months) = self.warranty_months {
            if months > MAX_WARRANTY_MONTHS {
                return Err(DomainError::invalid_argument(format!(
                    "warranty must be at most {MAX_WARRANTY_MONTHS} months, got {months}"
                )));
            }
        }
        if let Some(note) = &self.note {
            validate_note(note)?;
        }
        Ok(())
    }
}

/// Notes are free-form but bounded and never blank.
pub fn validate_note(note: &str) -> DomainResult<()> {
    if note.trim().is_empty() {
        return Err(DomainError::invalid_argument("note must not be blank"));
    }
    if note.chars().count() > MAX_NOTE_LEN {
        return Err(DomainError::invalid_argument(format!(
            "note exceeds {MAX_NOTE_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_terms_are_valid() {
        assert!(Terms::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let zero_lead = Terms {
            delivery_lead_time_days: Some(0),
            ..Terms::default()
        };
        assert!(zero_lead.validate().is_err());

        let huge_warranty = Terms {
            warranty_months: Some(MAX_WARRANTY_MONTHS + 1),
            ..Terms::default()
        };
        assert!(huge_warranty.validate().is_err());

        let over_paid = Terms {
            payment_method: Some(PaymentMethod::BankTransfer),
            down_payment_percent: Some(101),
            ..Terms::default()
        };
        assert!(over_paid.validate().is_err());
    }

    #[test]
    fn notes_are_capped_at_a_thousand_chars() {
        assert!(validate_note(&"a".repeat(1_000)).is_ok());
        assert!(matches!(
            validate_note(&"a".repeat(1_001)),
            Err(DomainError::InvalidArgument(_))
        ));
        assert!(validate_note("   ").is_err());
    }

    #[test]
    fn down_payment_needs_a_payment_method() {
        let terms = Terms {
            down_payment_percent: Some(50),
            ..Terms::default()
        };
        assert!(matches!(
            terms.validate(),
            Err(DomainError::InvalidArgument(_))
        ));
    }

    #[test]
    fn serializes_compactly() {
        let terms = Terms {
            delivery_lead_time_days: Some(14),
            shipping_terms: Some(ShippingTerms::Fob),
            ..Terms::default()
        };
        let json = serde_json::to_value(&terms).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "delivery_lead_time_days": 14, "shipping_terms": "FOB" })
        );
    }
}
