use std::collections::BTreeSet;

use serde::Serialize;

use crate::privacy::redact_and_round;
use crate::types::{ExtractRecord, PRACTICE_GROUP};

/// Headline counts for a study, redacted and rounded before release
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub total_events: u64,
    pub unique_patients: u64,
    pub patients_with_events: u64,
    pub unique_practices: u64,
    pub practices_with_events: u64,
}

/// Running tally of events, patients and practices.
///
/// Holds exact counts; only [`EventTally::finish`] output may be released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTally {
    total_events: u64,
    patients: BTreeSet<String>,
    patients_with_events: BTreeSet<String>,
    practices: BTreeSet<String>,
    practices_with_events: BTreeSet<String>,
}

impl EventTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a batch of records.
    ///
    /// Patients are identified by `patient_id` and practices by the practice
    /// column; records lacking either still count towards total events.
    pub fn add<'a>(&mut self, records: impl IntoIterator<Item = &'a ExtractRecord>) {
        for record in records {
            self.total_events += record.event_measure;
            let has_event = record.event_measure > 0;

            if let Some(id) = &record.patient_id {
                self.patients.insert(id.clone());
                if has_event {
                    self.patients_with_events.insert(id.clone());
                }
            }
            if let Some(practice) = record.category(PRACTICE_GROUP) {
                self.practices.insert(practice.to_string());
                if has_event {
                    self.practices_with_events.insert(practice.to_string());
                }
            }
        }
    }

    /// Redact and round every figure for release
    pub fn finish(&self, threshold: u64) -> EventSummary {
        let round = |n: usize| redact_and_round(n as u64, threshold);
        EventSummary {
            total_events: redact_and_round(self.total_events, threshold),
            unique_patients: round(self.patients.len()),
            patients_with_events: round(self.patients_with_events.len()),
            unique_practices: round(self.practices.len()),
            practices_with_events: round(self.practices_with_events.len()),
        }
    }
}
