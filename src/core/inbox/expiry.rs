use chrono::{DateTime, Utc};

use super::types::{InboxCommandRecord, InboxStatus};

/// Split of a set of records at one instant.
#[derive(Debug, Default)]
pub struct ExpiryEvaluation {
    /// Still pending and within their validity window, in input order.
    pub live: Vec<InboxCommandRecord>,
    /// Pending in storage but past their deadline; already marked expired.
    pub expired: Vec<InboxCommandRecord>,
}

/// A pending command whose deadline has strictly passed is expired.
pub fn is_expired(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> bool {
    now > expires_at
}

/// Evaluate lazy expiry over `records` at `now`. Terminal records are
/// dropped; pending ones are partitioned into live and newly expired.
pub fn evaluate_expiry(now: DateTime<Utc>, records: Vec<InboxCommandRecord>) -> ExpiryEvaluation {
    let mut eval = ExpiryEvaluation::default();
    for mut record in records {
        if record.status != InboxStatus::Pending {
            continue;
        }
        if is_expired(now, record.expires_at) {
            record.status = InboxStatus::Expired;
            record.completed_at = Some(now);
            eval.expired.push(record);
        } else {
            eval.live.push(record);
        }
    }
    eval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inbox::types::CommandPayload;
    use crate::core::policy::types::RawCommand;
    use proptest::prelude::*;

    fn record(id: i64, status: InboxStatus, expires_at: DateTime<Utc>) -> InboxCommandRecord {
        InboxCommandRecord {
            id,
            execution_id: format!("E{}", id),
            agent_id: "a".to_string(),
            payload: CommandPayload::Command(RawCommand {
                command: "true".to_string(),
                args: Vec::new(),
                env: Default::default(),
                timeout_secs: None,
            }),
            issued_at: expires_at - chrono::Duration::hours(1),
            expires_at,
            status,
            error_message: None,
            completed_at: None,
        }
    }

    #[test]
    fn deadline_equal_to_now_is_still_live() {
        let now = Utc::now();
        let eval = evaluate_expiry(now, vec![record(1, InboxStatus::Pending, now)]);
        assert_eq!(eval.live.len(), 1);
        assert!(eval.expired.is_empty());
    }

    #[test]
    fn past_deadline_is_flipped_and_stamped() {
        let now = Utc::now();
        let eval = evaluate_expiry(
            now,
            vec![record(
                1,
                InboxStatus::Pending,
                now - chrono::Duration::seconds(1),
            )],
        );
        assert!(eval.live.is_empty());
        assert_eq!(eval.expired[0].status, InboxStatus::Expired);
        assert_eq!(eval.expired[0].completed_at, Some(now));
    }

    #[test]
    fn terminal_records_are_ignored() {
        let now = Utc::now();
        let past = now - chrono::Duration::days(1);
        let eval = evaluate_expiry(
            now,
            vec![
                record(1, InboxStatus::Completed, past),
                record(2, InboxStatus::Failed, past),
                record(3, InboxStatus::Expired, past),
            ],
        );
        assert!(eval.live.is_empty());
        assert!(eval.expired.is_empty());
    }

    proptest! {
        #[test]
        fn live_records_never_past_deadline(offsets in proptest::collection::vec(-10_000i64..10_000, 0..40)) {
            let now = Utc::now();
            let records: Vec<_> = offsets
                .iter()
                .enumerate()
                .map(|(i, off)| record(i as i64, InboxStatus::Pending, now + chrono::Duration::milliseconds(*off)))
                .collect();
            let total = records.len();
            let eval = evaluate_expiry(now, records);

            prop_assert_eq!(eval.live.len() + eval.expired.len(), total);
            for r in &eval.live {
                prop_assert!(r.expires_at >= now);
                prop_assert_eq!(r.status, InboxStatus::Pending);
            }
            for r in &eval.expired {
                prop_assert!(r.expires_at < now);
            }
            let ids: Vec<i64> = eval.live.iter().map(|r| r.id).collect();
            let mut sorted = ids.clone();
            sorted.sort();
            prop_assert_eq!(ids, sorted);
        }
    }
}
