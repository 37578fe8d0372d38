//! Append-only negotiation history.
//!
//! The log has no public mutation API: entries are appended only by the
//! aggregate while applying an event, and a log rebuilt from storage is
//! validated before it is accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use haggle_core::{DomainError, Money, UserId};

use crate::negotiation::InvariantViolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    InitialQuote,
    CounterOffer,
    Accept,
    Reject,
    Cancel,
    Expire,
}

impl HistoryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryAction::InitialQuote => "initial_quote",
            HistoryAction::CounterOffer => "counter_offer",
            HistoryAction::Accept => "accept",
            HistoryAction::Reject => "reject",
            HistoryAction::Cancel => "cancel",
            HistoryAction::Expire => "expire",
        }
    }

    /// Actions that carry an offer snapshot.
    pub fn carries_offer(self) -> bool {
        matches!(self, HistoryAction::InitialQuote | HistoryAction::CounterOffer)
    }

    /// Actions that close the negotiation.
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            HistoryAction::Accept
                | HistoryAction::Reject
                | HistoryAction::Cancel
                | HistoryAction::Expire
        )
    }
}

impl core::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for HistoryAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial_quote" => Ok(HistoryAction::InitialQuote),
            "counter_offer" => Ok(HistoryAction::CounterOffer),
            "accept" => Ok(HistoryAction::Accept),
            "reject" => Ok(HistoryAction::Reject),
            "cancel" => Ok(HistoryAction::Cancel),
            "expire" => Ok(HistoryAction::Expire),
            other => Err(DomainError::invalid_argument(format!(
                "unknown history action '{other}'"
            ))),
        }
    }
}

/// A single audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// 1-based position in the log.
    pub sequence: u64,
    pub action: HistoryAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<Money>,
    /// `None` only for system actions (expiry).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Ordered, append-only sequence of history entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<HistoryEntry>", into = "Vec<HistoryEntry>")]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(
        &mut self,
        action: HistoryAction,
        offer: Option<Money>,
        actor_id: Option<UserId>,
        note: Option<String>,
        timestamp: DateTime<Utc>,
    ) {
        let sequence = self.entries.len() as u64 + 1;
        self.entries.push(HistoryEntry {
            sequence,
            action,
            offer,
            actor_id,
            note,
            timestamp,
        });
    }

    /// Rebuild a log read back from storage, rejecting anything that could not
    /// have been produced by appends alone.
    pub fn from_entries(entries: Vec<HistoryEntry>) -> Result<Self, InvariantViolation> {
        let mut last_ts: Option<DateTime<Utc>> = None;

        for (idx, entry) in entries.iter().enumerate() {
            let expected_seq = idx as u64 + 1;
            if entry.sequence != expected_seq {
                return Err(InvariantViolation::new(format!(
                    "history sequence gap: expected {expected_seq}, found {}",
                    entry.sequence
                )));
            }

            let is_first = idx == 0;
            if is_first != (entry.action == HistoryAction::InitialQuote) {
                return Err(InvariantViolation::new(format!(
                    "initial_quote must be exactly the first entry (found {} at {expected_seq})",
                    entry.action
                )));
            }

            if entry.action.carries_offer() != entry.offer.is_some() {
                return Err(InvariantViolation::new(format!(
                    "entry {expected_seq} ({}) has inconsistent offer snapshot",
                    entry.action
                )));
            }

            if (entry.action == HistoryAction::Expire) != entry.actor_id.is_none() {
                return Err(InvariantViolation::new(format!(
                    "entry {expected_seq} ({}) has inconsistent actor",
                    entry.action
                )));
            }

            if entry.action.is_closing() && idx + 1 != entries.len() {
                return Err(InvariantViolation::new(format!(
                    "entries follow closing action {} at {expected_seq}",
                    entry.action
                )));
            }

            if let Some(prev) = last_ts {
                if entry.timestamp < prev {
                    return Err(InvariantViolation::new(format!(
                        "history timestamps go backwards at {expected_seq}"
                    )));
                }
            }
            last_ts = Some(entry.timestamp);
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    pub fn count(&self, action: HistoryAction) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// Round as derived from the log: one plus the number of counter-offers.
    pub fn derived_round(&self) -> u32 {
        self.count(HistoryAction::CounterOffer) as u32 + 1
    }

    /// Actor who put the currently standing offer on the table.
    pub fn last_offer_actor(&self) -> Option<UserId> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.action.carries_offer())
            .and_then(|e| e.actor_id)
    }
}

impl TryFrom<Vec<HistoryEntry>> for History {
    type Error = InvariantViolation;

    fn try_from(value: Vec<HistoryEntry>) -> Result<Self, Self::Error> {
        History::from_entries(value)
    }
}

impl From<History> for Vec<HistoryEntry> {
    fn from(value: History) -> Self {
        value.entries
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a HistoryEntry;
    type IntoIter = core::slice::Iter<'a, HistoryEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use haggle_core::Currency;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn idr(amount: i64) -> Money {
        Money::new(amount, Currency::new("IDR").unwrap())
    }

    fn seeded() -> History {
        let mut h = History::new();
        h.append(
            HistoryAction::InitialQuote,
            Some(idr(1_000_000)),
            Some(UserId::new()),
            None,
            t0(),
        );
        h
    }

    #[test]
    fn append_assigns_contiguous_sequences() {
        let mut h = seeded();
        let vendor = UserId::new();
        h.append(
            HistoryAction::CounterOffer,
            Some(idr(950_000)),
            Some(vendor),
            Some("can go lower".into()),
            t0() + Duration::hours(1),
        );

        let seqs: Vec<u64> = h.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(h.derived_round(), 2);
        assert_eq!(h.last_offer_actor(), Some(vendor));
    }

    #[test]
    fn rebuild_rejects_entries_after_close() {
        let mut h = seeded();
        h.append(
            HistoryAction::Accept,
            None,
            Some(UserId::new()),
            None,
            t0() + Duration::hours(1),
        );
        let mut entries: Vec<HistoryEntry> = h.into();
        entries.push(HistoryEntry {
            sequence: 3,
            action: HistoryAction::CounterOffer,
            offer: Some(idr(1)),
            actor_id: Some(UserId::new()),
            note: None,
            timestamp: t0() + Duration::hours(2),
        });

        assert!(History::from_entries(entries).is_err());
    }

    #[test]
    fn rebuild_rejects_sequence_gaps_and_missing_seed() {
        let mut entries: Vec<HistoryEntry> = seeded().into();
        entries[0].sequence = 2;
        assert!(History::from_entries(entries).is_err());

        let no_seed = vec![HistoryEntry {
            sequence: 1,
            action: HistoryAction::CounterOffer,
            offer: Some(idr(5)),
            actor_id: Some(UserId::new()),
            note: None,
            timestamp: t0(),
        }];
        assert!(History::from_entries(no_seed).is_err());
    }

    #[test]
    fn action_names_parse_back() {
        for action in [
            HistoryAction::InitialQuote,
            HistoryAction::CounterOffer,
            HistoryAction::Accept,
            HistoryAction::Reject,
            HistoryAction::Cancel,
            HistoryAction::Expire,
        ] {
            assert_eq!(action.as_str().parse::<HistoryAction>().unwrap(), action);
        }
        assert!("haggle".parse::<HistoryAction>().is_err());
    }

    #[test]
    fn deserialization_goes_through_validation() {
        let original = seeded();
        let json = serde_json::to_string(&original).unwrap();
        let back: History = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);

        let broken = json.replace("\"sequence\":1", "\"sequence\":7");
        assert!(serde_json::from_str::<History>(&broken).is_err());
    }
}
