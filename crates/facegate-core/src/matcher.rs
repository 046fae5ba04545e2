//! Nearest-neighbour matching of a query descriptor against enrolled records.

use crate::types::{Descriptor, IdentityRecord, LengthMismatch};

/// Result of scanning the candidate set.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome<'a> {
    /// Closest record and its distance to the query.
    Best {
        record: &'a IdentityRecord,
        distance: f32,
    },
    /// The candidate set was empty. A normal outcome, not an error.
    NoCandidates,
}

/// Strategy for finding the closest enrolled record to a query descriptor.
pub trait Matcher: Send + Sync {
    fn find_best_match<'a>(
        &self,
        query: &Descriptor,
        candidates: &'a [IdentityRecord],
    ) -> Result<MatchOutcome<'a>, LengthMismatch>;
}

/// Brute-force Euclidean matcher.
///
/// Linear scan over every candidate per query, O(n) in the number of
/// enrolled records with no index. This is the scalability ceiling of the
/// system; the store is expected to stay small.
///
/// Only a strictly smaller distance replaces the current best, so on ties
/// the record that comes first in store order wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn find_best_match<'a>(
        &self,
        query: &Descriptor,
        candidates: &'a [IdentityRecord],
    ) -> Result<MatchOutcome<'a>, LengthMismatch> {
        let mut best: Option<(&'a IdentityRecord, f32)> = None;

        for record in candidates {
            let distance = query.distance(&record.descriptor)?;
            let is_better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if is_better {
                best = Some((record, distance));
            }
        }

        Ok(match best {
            Some((record, distance)) => MatchOutcome::Best { record, distance },
            None => MatchOutcome::NoCandidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn record(name: &str, values: &[f32]) -> IdentityRecord {
        IdentityRecord {
            name: name.into(),
            descriptor: Descriptor::new(values.to_vec()),
            enrolled_at: DateTime::from_timestamp_millis(0).unwrap(),
        }
    }

    #[test]
    fn test_empty_candidates() {
        let query = Descriptor::new(vec![1.0, 0.0]);
        let outcome = EuclideanMatcher.find_best_match(&query, &[]).unwrap();
        assert_eq!(outcome, MatchOutcome::NoCandidates);
    }

    #[test]
    fn test_scans_every_candidate() {
        // Closest record is last
        let query = Descriptor::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            record("decoy1", &[0.0, 1.0, 0.0]),
            record("decoy2", &[0.0, 0.0, 1.0]),
            record("match", &[0.9, 0.0, 0.0]),
        ];

        match EuclideanMatcher.find_best_match(&query, &gallery).unwrap() {
            MatchOutcome::Best { record, distance } => {
                assert_eq!(record.name, "match");
                assert!((distance - 0.1).abs() < 1e-6);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_tie_goes_to_first_in_store_order() {
        let query = Descriptor::new(vec![0.0, 0.0]);
        let gallery = vec![
            record("far", &[2.0, 2.0]),
            record("first", &[0.3, 0.0]),
            record("second", &[0.0, 0.3]),
        ];

        match EuclideanMatcher.find_best_match(&query, &gallery).unwrap() {
            MatchOutcome::Best { record, distance } => {
                assert_eq!(record.name, "first");
                assert!((distance - 0.3).abs() < 1e-6);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        let query = Descriptor::new(vec![0.0, 0.0]);
        let gallery = vec![record("ok", &[0.0, 0.0]), record("bad", &[0.0, 0.0, 0.0])];
        let err = EuclideanMatcher.find_best_match(&query, &gallery).unwrap_err();
        assert_eq!(err, LengthMismatch { expected: 2, found: 3 });
    }
}
