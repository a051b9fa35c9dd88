//! Best-effort company enrichment for list members.
//!
//! Company lookups are independent of each other, so they fan out with a
//! bounded number in flight. A failed lookup is logged and skipped; it never
//! fails the batch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::crm::client::{CompanyRecord, CrmClient, CrmError};
use crate::crm::pages::ExternalListSnapshot;
use crate::sync::cancel::CancellationToken;

#[async_trait]
pub trait CompanySource: Send + Sync + 'static {
    async fn fetch_company(&self, company_id: &str) -> Result<CompanyRecord, CrmError>;
}

#[async_trait]
impl CompanySource for CrmClient {
    async fn fetch_company(&self, company_id: &str) -> Result<CompanyRecord, CrmError> {
        CrmClient::fetch_company(self, company_id).await
    }
}

/// Distinct associated company ids in first-seen order, each with the number
/// of list members pointing at it. Contacts without a company are skipped.
pub fn associated_companies(snapshot: &ExternalListSnapshot) -> Vec<(String, usize)> {
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for contact in snapshot.contacts() {
        let Some(company_id) = contact.company_id() else {
            continue;
        };
        let count = counts.entry(company_id.to_string()).or_insert(0);
        if *count == 0 {
            order.push(company_id.to_string());
        }
        *count += 1;
    }
    order
        .into_iter()
        .map(|id| {
            let count = counts.get(&id).copied().unwrap_or(0);
            (id, count)
        })
        .collect()
}

/// Fetch every company in `companies`, at most `concurrency` at a time.
///
/// Returns the records that were fetched, in input order. Stops issuing new
/// lookups once `cancel` fires.
pub async fn fetch_companies<S: CompanySource>(
    source: Arc<S>,
    companies: Vec<(String, usize)>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Vec<CompanyRecord> {
    let total = companies.len();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut join_set = JoinSet::new();

    for (pos, (company_id, member_count)) in companies.into_iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let source = source.clone();
        join_set.spawn(async move {
            let _permit = permit;
            let result = source.fetch_company(&company_id).await;
            (pos, company_id, member_count, result)
        });
    }

    let mut fetched: Vec<(usize, CompanyRecord)> = Vec::with_capacity(total);
    let mut skipped = 0usize;
    loop {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                join_set.abort_all();
                break;
            }
            joined = join_set.join_next() => joined,
        };
        let Some(joined) = joined else {
            break;
        };
        match joined {
            Ok((pos, _, member_count, Ok(mut company))) => {
                company.member_count = member_count;
                fetched.push((pos, company));
            }
            Ok((_, company_id, _, Err(e))) => {
                skipped += 1;
                log::warn!("Company {}: lookup failed, skipping: {}", company_id, e);
            }
            Err(e) => {
                skipped += 1;
                log::warn!("Company lookup task failed: {}", e);
            }
        }
    }

    fetched.sort_by_key(|(pos, _)| *pos);
    log::info!(
        "Company enrichment: {} of {} fetched, {} skipped",
        fetched.len(),
        total,
        skipped
    );
    fetched.into_iter().map(|(_, company)| company).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::crm::pages::test_support::contact;

    struct FakeCompanies {
        failing: Vec<String>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeCompanies {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompanySource for FakeCompanies {
        async fn fetch_company(&self, company_id: &str) -> Result<CompanyRecord, CrmError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.iter().any(|f| f == company_id) {
                return Err(CrmError::Status {
                    status: 404,
                    body: "not found".to_string(),
                });
            }
            Ok(CompanyRecord {
                id: company_id.to_string(),
                name: Some(format!("Company {company_id}")),
                domain: None,
                industry: None,
                city: None,
                state: None,
                website: None,
                member_count: 0,
            })
        }
    }

    fn ids(n: usize) -> Vec<(String, usize)> {
        (1..=n).map(|i| (i.to_string(), 1)).collect()
    }

    #[test]
    fn test_associated_companies_counts_members_and_skips_unassociated() {
        let snapshot = ExternalListSnapshot::from_contacts(
            1,
            vec![
                contact("1", &[("associatedcompanyid", "900")]),
                contact("2", &[]),
                contact("3", &[("associatedcompanyid", "800")]),
                contact("4", &[("associatedcompanyid", "900")]),
                contact("5", &[("associatedcompanyid", "  ")]),
            ],
        );
        assert_eq!(
            associated_companies(&snapshot),
            vec![("900".to_string(), 2), ("800".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_failed_lookup_is_skipped_not_fatal() {
        let source = Arc::new(FakeCompanies::new(&["2"]));
        let companies = fetch_companies(source, ids(3), 2, &CancellationToken::new()).await;
        let got: Vec<&str> = companies.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(got, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn test_fan_out_is_bounded_and_ordered() {
        let source = Arc::new(FakeCompanies::new(&[]));
        let companies =
            fetch_companies(source.clone(), ids(10), 3, &CancellationToken::new()).await;

        assert_eq!(companies.len(), 10);
        let got: Vec<String> = companies.iter().map(|c| c.id.clone()).collect();
        let want: Vec<String> = (1..=10).map(|i| i.to_string()).collect();
        assert_eq!(got, want);
        assert!(source.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_member_count_is_attached() {
        let source = Arc::new(FakeCompanies::new(&[]));
        let companies = fetch_companies(
            source,
            vec![("900".to_string(), 4)],
            1,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(companies[0].member_count, 4);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_fetches_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let source = Arc::new(FakeCompanies::new(&[]));
        let companies = fetch_companies(source.clone(), ids(5), 2, &token).await;
        assert!(companies.is_empty());
    }
}
