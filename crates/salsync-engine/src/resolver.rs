//! Identity resolver
//!
//! Holds the natural key → remote account id mapping. It is seeded from
//! ledger replay and only grows through [`IdentityResolver::confirm`], which
//! the pipeline calls for succeeded person results. Salaries are planned
//! against confirmed identities only.

use salsync_common::types::{
    ExternalIdentity, NaturalKey, PersonRecord, RecordKind, SalaryKey, SalaryRecord,
};
use salsync_common::{Result, SyncError};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::record::{OutboundRecord, PersonPayload, SalaryPayload};
use crate::report::{KindCounts, SyncIssue};
use crate::source::RowResult;

/// People to upload plus what was left out and why
#[derive(Debug, Default)]
pub struct PersonPlan {
    pub to_upload: Vec<OutboundRecord>,
    pub counts: KindCounts,
    pub issues: Vec<SyncIssue>,
}

#[derive(Debug, Default)]
pub struct IdentityResolver {
    confirmed: HashMap<NaturalKey, String>,
    // Confirmed after seeding; their rows were already counted as created
    settled_this_run: HashSet<NaturalKey>,
    record_type_id: Option<String>,
}

impl IdentityResolver {
    pub fn new(record_type_id: Option<String>) -> Self {
        Self {
            confirmed: HashMap::new(),
            settled_this_run: HashSet::new(),
            record_type_id,
        }
    }

    /// Start from identities recovered by ledger replay
    pub fn seeded(
        identities: impl IntoIterator<Item = ExternalIdentity>,
        record_type_id: Option<String>,
    ) -> Self {
        let mut resolver = Self::new(record_type_id);
        for identity in identities {
            resolver.confirm(&identity.natural_key, &identity.remote_id);
        }
        resolver.settled_this_run.clear();
        resolver
    }

    /// Decide which person rows need uploading
    ///
    /// Confirmed keys are skipped, repeated keys are duplicates (the first
    /// occurrence wins), malformed rows are reported. Any other error from
    /// the row stream is returned.
    ///
    /// A key confirmed earlier in this run (by a recovered job) was already
    /// counted as created, so its first row is not counted again.
    pub fn plan_people<I>(&self, rows: I) -> Result<PersonPlan>
    where
        I: IntoIterator<Item = RowResult<PersonRecord>>,
    {
        let mut plan = PersonPlan::default();
        let mut queued: HashSet<NaturalKey> = HashSet::new();

        for row in rows {
            plan.counts.read += 1;
            let person = match row {
                Ok(person) => person,
                Err(e @ SyncError::MalformedRow { .. }) => {
                    warn!(error = %e, "Skipping malformed person row");
                    plan.counts.malformed += 1;
                    plan.issues.push(SyncIssue::from_error(RecordKind::Person, &e));
                    continue;
                }
                Err(e) => return Err(e),
            };

            if self.confirmed.contains_key(&person.natural_key) {
                let first_row = queued.insert(person.natural_key.clone());
                if !(first_row && self.settled_this_run.contains(&person.natural_key)) {
                    debug!(key = %person.natural_key, "Person already synced, reusing identity");
                    plan.counts.skipped += 1;
                }
                continue;
            }

            if !queued.insert(person.natural_key.clone()) {
                let err = SyncError::DuplicateNaturalKey(person.natural_key.to_string());
                warn!(source_id = person.source_id, error = %err, "Skipping duplicate person");
                plan.counts.duplicates += 1;
                plan.issues.push(
                    SyncIssue::from_error(RecordKind::Person, &err)
                        .with_key(person.natural_key.as_str()),
                );
                continue;
            }

            plan.to_upload.push(OutboundRecord::Person(PersonPayload::from_record(
                &person,
                self.record_type_id.as_deref(),
            )));
        }

        Ok(plan)
    }

    /// Record a remote id for a natural key
    ///
    /// Returns `false` and keeps the existing id when the key is already
    /// mapped to a different one, or when `remote_id` is blank.
    pub fn confirm(&mut self, key: &NaturalKey, remote_id: &str) -> bool {
        if remote_id.trim().is_empty() {
            warn!(key = %key, "Refusing to confirm a natural key without a remote id");
            return false;
        }
        match self.confirmed.get(key) {
            Some(existing) if existing == remote_id => true,
            Some(existing) => {
                warn!(
                    key = %key,
                    existing = %existing,
                    refused = %remote_id,
                    "Natural key already confirmed with another remote id"
                );
                false
            }
            None => {
                self.confirmed.insert(key.clone(), remote_id.to_string());
                self.settled_this_run.insert(key.clone());
                true
            }
        }
    }

    pub fn identity_of(&self, key: &NaturalKey) -> Option<&str> {
        self.confirmed.get(key).map(String::as_str)
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed.len()
    }

    /// Lazily turn salary rows into payloads for confirmed people
    ///
    /// Keys in `settled_this_run` (also in `already_succeeded`) were counted
    /// as created by a recovered job; their first row is passed over quietly.
    pub fn salaries<'r, I>(
        &'r self,
        rows: I,
        already_succeeded: &'r HashSet<SalaryKey>,
        settled_this_run: &'r HashSet<SalaryKey>,
    ) -> SalaryPlanner<'r, I>
    where
        I: Iterator<Item = RowResult<SalaryRecord>>,
    {
        SalaryPlanner {
            resolver: self,
            rows,
            already_succeeded,
            settled_this_run,
            seen: HashSet::new(),
            counts: KindCounts::default(),
            issues: Vec::new(),
            error: None,
        }
    }
}

/// Iterator adapter yielding salary payloads that may be batched
///
/// Rows it holds back are counted; call [`SalaryPlanner::finish`] once the
/// iterator is drained.
pub struct SalaryPlanner<'r, I> {
    resolver: &'r IdentityResolver,
    rows: I,
    already_succeeded: &'r HashSet<SalaryKey>,
    settled_this_run: &'r HashSet<SalaryKey>,
    seen: HashSet<SalaryKey>,
    counts: KindCounts,
    issues: Vec<SyncIssue>,
    error: Option<SyncError>,
}

impl<I> SalaryPlanner<'_, I> {
    /// Counts and issues, or the error that stopped the row stream
    pub fn finish(self) -> Result<(KindCounts, Vec<SyncIssue>)> {
        match self.error {
            Some(e) => Err(e),
            None => Ok((self.counts, self.issues)),
        }
    }
}

impl<I> Iterator for SalaryPlanner<'_, I>
where
    I: Iterator<Item = RowResult<SalaryRecord>>,
{
    type Item = OutboundRecord;

    fn next(&mut self) -> Option<OutboundRecord> {
        if self.error.is_some() {
            return None;
        }

        loop {
            let row = self.rows.next()?;
            self.counts.read += 1;

            let salary = match row {
                Ok(salary) => salary,
                Err(e @ SyncError::MalformedRow { .. }) => {
                    warn!(error = %e, "Skipping malformed salary row");
                    self.counts.malformed += 1;
                    self.issues.push(SyncIssue::from_error(RecordKind::Salary, &e));
                    continue;
                }
                Err(e) => {
                    self.error = Some(e);
                    return None;
                }
            };

            let key = salary.key();
            if self.already_succeeded.contains(&key) {
                let first_row = self.seen.insert(key.clone());
                if !(first_row && self.settled_this_run.contains(&key)) {
                    self.counts.skipped += 1;
                }
                continue;
            }

            if !self.seen.insert(key.clone()) {
                warn!(key = %key, source_id = salary.source_id, "Skipping duplicate salary row");
                self.counts.duplicates += 1;
                self.issues.push(
                    SyncIssue::new(
                        RecordKind::Salary,
                        "duplicate_salary",
                        format!("Salary {} appears more than once", key),
                    )
                    .with_key(key.as_str()),
                );
                continue;
            }

            match self.resolver.identity_of(&salary.person_key) {
                Some(remote_id) => {
                    return Some(OutboundRecord::Salary(SalaryPayload::from_record(
                        &salary, remote_id,
                    )))
                }
                None => {
                    debug!(key = %key, "Person not confirmed, salary blocked");
                    self.counts.blocked_by_dependency += 1;
                    self.issues.push(
                        SyncIssue::new(
                            RecordKind::Salary,
                            "blocked_by_dependency",
                            format!("No confirmed account for person {}", salary.person_key),
                        )
                        .with_key(key.as_str()),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn person(id: i64, first: &str, last: &str) -> RowResult<PersonRecord> {
        Ok(PersonRecord::new(id, first, last, None, None))
    }

    fn salary(id: i64, first: &str, last: &str, day: u32) -> RowResult<SalaryRecord> {
        Ok(SalaryRecord {
            source_id: id,
            person_key: NaturalKey::new(first, last, None, None),
            effective_date: NaiveDate::from_ymd_opt(2021, 1, day).unwrap(),
            salary: Some(1000.0),
            bonus: None,
            total_pay: None,
            title: None,
            employer: None,
            source_file: None,
            line_number: None,
        })
    }

    #[test]
    fn test_duplicate_natural_key_keeps_first() {
        let resolver = IdentityResolver::new(None);
        let plan = resolver
            .plan_people(vec![
                person(1, "Ada", "Lovelace"),
                person(2, "Grace", "Hopper"),
                person(3, " ADA", "lovelace "),
            ])
            .unwrap();

        assert_eq!(plan.to_upload.len(), 2);
        assert_eq!(plan.counts.read, 3);
        assert_eq!(plan.counts.duplicates, 1);
        assert_eq!(plan.issues[0].code, "duplicate_natural_key");
        match &plan.to_upload[0] {
            OutboundRecord::Person(p) => assert_eq!(p.source_id, 1),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_confirmed_people_are_skipped() {
        let ada = NaturalKey::new("Ada", "Lovelace", None, None);
        let resolver = IdentityResolver::seeded(
            [ExternalIdentity {
                natural_key: ada.clone(),
                remote_id: "001A".into(),
            }],
            None,
        );

        let plan = resolver
            .plan_people(vec![person(1, "Ada", "Lovelace"), person(2, "Grace", "Hopper")])
            .unwrap();
        assert_eq!(plan.counts.skipped, 1);
        assert_eq!(plan.to_upload.len(), 1);
        assert_eq!(resolver.identity_of(&ada), Some("001A"));
    }

    #[test]
    fn test_malformed_rows_are_counted_and_fatal_errors_propagate() {
        let resolver = IdentityResolver::new(None);
        let plan = resolver
            .plan_people(vec![
                Err(SyncError::malformed("Person", 4, "FirstName is empty")),
                person(5, "Ada", "Lovelace"),
            ])
            .unwrap();
        assert_eq!(plan.counts.malformed, 1);
        assert_eq!(plan.to_upload.len(), 1);

        let err = resolver
            .plan_people(vec![Err(SyncError::SourceUnavailable("gone".into()))])
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_confirm_refuses_second_identity() {
        let mut resolver = IdentityResolver::new(None);
        let key = NaturalKey::new("Ada", "Lovelace", None, None);
        assert!(resolver.confirm(&key, "001A"));
        assert!(resolver.confirm(&key, "001A"));
        assert!(!resolver.confirm(&key, "001B"));
        assert_eq!(resolver.identity_of(&key), Some("001A"));
        assert_eq!(resolver.confirmed_count(), 1);
    }

    #[test]
    fn test_confirm_refuses_blank_remote_id() {
        let mut resolver = IdentityResolver::new(None);
        let key = NaturalKey::new("Ada", "Lovelace", None, None);
        assert!(!resolver.confirm(&key, ""));
        assert!(!resolver.confirm(&key, "  "));
        assert_eq!(resolver.identity_of(&key), None);

        let seeded = IdentityResolver::seeded(
            [ExternalIdentity {
                natural_key: key.clone(),
                remote_id: String::new(),
            }],
            None,
        );
        assert_eq!(seeded.confirmed_count(), 0);
    }

    #[test]
    fn test_people_confirmed_this_run_are_not_counted_twice() {
        let grace = NaturalKey::new("Grace", "Hopper", None, None);
        let mut resolver = IdentityResolver::seeded(
            [ExternalIdentity {
                natural_key: NaturalKey::new("Ada", "Lovelace", None, None),
                remote_id: "001A".into(),
            }],
            None,
        );
        // Settled by a recovered job before planning
        assert!(resolver.confirm(&grace, "001G"));

        let plan = resolver
            .plan_people(vec![
                person(1, "Ada", "Lovelace"),
                person(2, "Grace", "Hopper"),
                person(3, "Grace", "Hopper"),
            ])
            .unwrap();

        assert!(plan.to_upload.is_empty());
        assert_eq!(plan.counts.read, 3);
        // Ada from an earlier run, plus Grace's repeated row
        assert_eq!(plan.counts.skipped, 2);
    }

    #[test]
    fn test_salary_planning() {
        let mut resolver = IdentityResolver::new(None);
        resolver.confirm(&NaturalKey::new("Ada", "Lovelace", None, None), "001A");

        let done = salary(9, "Ada", "Lovelace", 2).unwrap().key();
        let already: HashSet<SalaryKey> = [done].into_iter().collect();

        let rows = vec![
            salary(1, "Ada", "Lovelace", 1),
            salary(2, "Ada", "Lovelace", 2),
            salary(3, "Ada", "Lovelace", 1),
            salary(4, "Grace", "Hopper", 1),
            Err(SyncError::malformed("Salary", 5, "EntryDate is empty")),
        ];

        let settled = HashSet::new();
        let mut planner = resolver.salaries(rows.into_iter(), &already, &settled);
        let payloads: Vec<_> = planner.by_ref().collect();
        let (counts, issues) = planner.finish().unwrap();

        assert_eq!(payloads.len(), 1);
        match &payloads[0] {
            OutboundRecord::Salary(s) => {
                assert_eq!(s.person_remote_id, "001A");
                assert_eq!(s.source_id, 1);
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert_eq!(counts.read, 5);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.duplicates, 1);
        assert_eq!(counts.blocked_by_dependency, 1);
        assert_eq!(counts.malformed, 1);
        assert!(issues.iter().any(|i| i.code == "blocked_by_dependency"));
    }

    #[test]
    fn test_salaries_settled_this_run_are_not_counted_twice() {
        let mut resolver = IdentityResolver::new(None);
        resolver.confirm(&NaturalKey::new("Ada", "Lovelace", None, None), "001A");

        let earlier = salary(1, "Ada", "Lovelace", 1).unwrap().key();
        let recovered = salary(2, "Ada", "Lovelace", 2).unwrap().key();
        let already: HashSet<SalaryKey> = [earlier, recovered.clone()].into_iter().collect();
        let settled: HashSet<SalaryKey> = [recovered].into_iter().collect();

        let rows = vec![
            salary(1, "Ada", "Lovelace", 1),
            salary(2, "Ada", "Lovelace", 2),
            salary(3, "Ada", "Lovelace", 3),
        ];
        let mut planner = resolver.salaries(rows.into_iter(), &already, &settled);
        let payloads: Vec<_> = planner.by_ref().collect();
        let (counts, _) = planner.finish().unwrap();

        assert_eq!(payloads.len(), 1);
        assert_eq!(counts.read, 3);
        assert_eq!(counts.skipped, 1);
    }

    #[test]
    fn test_salary_planner_stops_on_store_failure() {
        let resolver = IdentityResolver::new(None);
        let already = HashSet::new();
        let rows = vec![Err(SyncError::SourceUnavailable("disk gone".into()))];

        let mut planner = resolver.salaries(rows.into_iter(), &already, &already);
        assert!(planner.next().is_none());
        assert!(matches!(
            planner.finish(),
            Err(SyncError::SourceUnavailable(_))
        ));
    }
}
