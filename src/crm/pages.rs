//! Cursor-following aggregation of a CRM list into one snapshot.
//!
//! Pages are pulled strictly in sequence since each request needs the cursor
//! from the one before it. `ContactPages` yields one page per call so a caller
//! can stop between pages, and can be resumed from a saved cursor.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::crm::client::{ContactPage, CrmClient, CrmError, ExternalContactRecord};
use crate::error::SyncError;
use crate::sync::cancel::CancellationToken;

/// Anything that can serve one page of list contacts.
#[async_trait]
pub trait ContactPageSource: Send + Sync {
    async fn fetch_contact_page(
        &self,
        list_id: u64,
        count: u32,
        cursor: Option<&str>,
    ) -> Result<ContactPage, CrmError>;
}

#[async_trait]
impl ContactPageSource for CrmClient {
    async fn fetch_contact_page(
        &self,
        list_id: u64,
        count: u32,
        cursor: Option<&str>,
    ) -> Result<ContactPage, CrmError> {
        CrmClient::fetch_contact_page(self, list_id, count, cursor).await
    }
}

/// Lazy sequence of contact pages for one list.
pub struct ContactPages<'a, S: ContactPageSource + ?Sized> {
    source: &'a S,
    list_id: u64,
    page_size: u32,
    cursor: Option<String>,
    /// Every cursor this walk has requested. A repeat means the list loops.
    seen_cursors: HashSet<String>,
    pages_fetched: usize,
    exhausted: bool,
}

impl<'a, S: ContactPageSource + ?Sized> ContactPages<'a, S> {
    pub fn new(source: &'a S, list_id: u64, page_size: u32) -> Self {
        Self {
            source,
            list_id,
            page_size: page_size.max(1),
            cursor: None,
            seen_cursors: HashSet::new(),
            pages_fetched: 0,
            exhausted: false,
        }
    }

    /// Continue a previous walk from the cursor it stopped at.
    pub fn resume_from(
        source: &'a S,
        list_id: u64,
        page_size: u32,
        cursor: impl Into<String>,
    ) -> Self {
        let cursor = cursor.into();
        let mut pages = Self::new(source, list_id, page_size);
        pages.seen_cursors.insert(cursor.clone());
        pages.cursor = Some(cursor);
        pages
    }

    /// Cursor the next request will use. `None` before the first page.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// True once the service has reported no further cursor.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Fetch the next page. Returns `Ok(None)` once the list is exhausted.
    ///
    /// A failed request leaves the cursor where it was, so calling again
    /// retries the same page.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ExternalContactRecord>>, SyncError> {
        if self.exhausted {
            return Ok(None);
        }

        let page_number = self.pages_fetched + 1;
        let page_error = |cursor: &Option<String>, source: CrmError| SyncError::Page {
            page: page_number,
            cursor: cursor.clone().unwrap_or_else(|| "start".to_string()),
            source,
        };

        let page = self
            .source
            .fetch_contact_page(self.list_id, self.page_size, self.cursor.as_deref())
            .await
            .map_err(|e| page_error(&self.cursor, e))?;

        if let Some(next) = &page.next_cursor {
            if self.seen_cursors.contains(next) {
                return Err(page_error(
                    &self.cursor,
                    CrmError::Parse(format!(
                        "pagination cursor {next:?} repeats; the list did not advance"
                    )),
                ));
            }
        }

        self.pages_fetched = page_number;
        match page.next_cursor {
            Some(next) => {
                self.seen_cursors.insert(next.clone());
                self.cursor = Some(next);
            }
            None => self.exhausted = true,
        }
        Ok(Some(page.contacts))
    }
}

/// A complete enumeration of one external list.
///
/// Only `fetch_snapshot` builds one, and only after pagination is exhausted,
/// so holding a snapshot means absence from it is meaningful.
#[derive(Debug, Clone)]
pub struct ExternalListSnapshot {
    list_id: u64,
    contacts: Vec<ExternalContactRecord>,
    index: HashMap<String, usize>,
    pages: usize,
}

impl ExternalListSnapshot {
    fn complete(list_id: u64, contacts: Vec<ExternalContactRecord>, pages: usize) -> Self {
        let mut index = HashMap::with_capacity(contacts.len());
        for (pos, contact) in contacts.iter().enumerate() {
            index.entry(contact.id.clone()).or_insert(pos);
        }
        Self {
            list_id,
            contacts,
            index,
            pages,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_contacts(list_id: u64, contacts: Vec<ExternalContactRecord>) -> Self {
        Self::complete(list_id, contacts, 1)
    }

    pub fn list_id(&self) -> u64 {
        self.list_id
    }

    pub fn get(&self, id: &str) -> Option<&ExternalContactRecord> {
        self.index.get(id).map(|&pos| &self.contacts[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Records in the order the service returned them.
    pub fn contacts(&self) -> &[ExternalContactRecord] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn pages(&self) -> usize {
        self.pages
    }
}

/// Result of walking a list: either the whole list or a cancelled walk.
#[derive(Debug)]
pub enum SnapshotOutcome {
    Complete(ExternalListSnapshot),
    Cancelled {
        pages_fetched: usize,
        contacts_seen: usize,
    },
}

/// Walk every page of `list_id` and return the complete snapshot.
///
/// Any page failure fails the whole walk; no partial snapshot is returned.
pub async fn fetch_snapshot<S: ContactPageSource + ?Sized>(
    source: &S,
    list_id: u64,
    page_size: u32,
    cancel: &CancellationToken,
) -> Result<SnapshotOutcome, SyncError> {
    let mut pages = ContactPages::new(source, list_id, page_size);
    let mut contacts = Vec::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            next = pages.next_page() => Some(next?),
        };

        let Some(next) = next else {
            log::info!(
                "List {}: walk cancelled after {} pages ({} contacts)",
                list_id,
                pages.pages_fetched(),
                contacts.len()
            );
            return Ok(SnapshotOutcome::Cancelled {
                pages_fetched: pages.pages_fetched(),
                contacts_seen: contacts.len(),
            });
        };

        match next {
            Some(batch) => {
                log::debug!(
                    "List {}: page {} returned {} contacts",
                    list_id,
                    pages.pages_fetched(),
                    batch.len()
                );
                contacts.extend(batch);
            }
            None => break,
        }
    }

    log::info!(
        "List {}: fetched {} contacts in {} pages",
        list_id,
        contacts.len(),
        pages.pages_fetched()
    );
    Ok(SnapshotOutcome::Complete(ExternalListSnapshot::complete(
        list_id,
        contacts,
        pages.pages_fetched(),
    )))
}


#[cfg(test)]
mod tests {
    use super::test_support::{contact, FakePages};
    use super::*;

    fn three_pages() -> FakePages {
        FakePages::new(vec![
            vec![contact("1", &[]), contact("2", &[])],
            vec![contact("3", &[])],
            vec![contact("4", &[]), contact("5", &[])],
        ])
    }

    #[tokio::test]
    async fn test_snapshot_concatenates_pages_in_order() {
        let source = three_pages();
        let outcome = fetch_snapshot(&source, 7, 2, &CancellationToken::new())
            .await
            .expect("snapshot");

        let SnapshotOutcome::Complete(snapshot) = outcome else {
            panic!("expected complete snapshot");
        };
        let ids: Vec<&str> = snapshot.contacts().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4", "5"]);
        assert_eq!(snapshot.pages(), 3);
        assert_eq!(snapshot.list_id(), 7);
        assert!(snapshot.contains("4"));
        assert!(snapshot.get("9").is_none());
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_page_failure_fails_whole_walk() {
        let mut source = three_pages();
        source.fail_at = Some(1);

        let err = fetch_snapshot(&source, 7, 2, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SyncError::Page { page, cursor, .. } => {
                assert_eq!(page, 2);
                assert_eq!(cursor, "1");
            }
            other => panic!("expected page error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_between_pages_yields_no_snapshot() {
        let token = CancellationToken::new();
        let mut source = three_pages();
        source.cancel_after = Some((1, token.clone()));

        let outcome = fetch_snapshot(&source, 7, 2, &token).await.expect("outcome");
        match outcome {
            SnapshotOutcome::Cancelled {
                pages_fetched,
                contacts_seen,
            } => {
                assert_eq!(pages_fetched, 1);
                assert_eq!(contacts_seen, 2);
            }
            SnapshotOutcome::Complete(_) => panic!("cancelled walk must not complete"),
        }
        assert_eq!(source.calls(), 1, "no request after cancellation");
    }

    #[tokio::test]
    async fn test_pages_resume_from_cursor() {
        let source = three_pages();
        let mut pages = ContactPages::resume_from(&source, 7, 2, "1");

        let first = pages.next_page().await.expect("page").expect("some");
        assert_eq!(first[0].id, "3");
        assert_eq!(pages.cursor(), Some("2"));

        let second = pages.next_page().await.expect("page").expect("some");
        assert_eq!(second.len(), 2);
        assert!(pages.is_exhausted());
        assert!(pages.next_page().await.expect("done").is_none());
    }

    #[tokio::test]
    async fn test_failed_page_can_be_retried() {
        let mut source = three_pages();
        source.fail_at = Some(0);
        let mut pages = ContactPages::new(&source, 7, 2);
        assert!(pages.next_page().await.is_err());
        assert_eq!(pages.pages_fetched(), 0);
        assert_eq!(pages.cursor(), None);
    }

    struct StuckCursor;

    #[async_trait]
    impl ContactPageSource for StuckCursor {
        async fn fetch_contact_page(
            &self,
            _list_id: u64,
            _count: u32,
            _cursor: Option<&str>,
        ) -> Result<ContactPage, CrmError> {
            Ok(ContactPage {
                contacts: vec![contact("1", &[])],
                next_cursor: Some("same".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_stuck_cursor_is_rejected() {
        let err = fetch_snapshot(&StuckCursor, 7, 10, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not advance"), "{err}");
    }

    /// Serves `start -> a -> b -> a`, a loop that never reaches the end.
    struct CyclingCursor;

    #[async_trait]
    impl ContactPageSource for CyclingCursor {
        async fn fetch_contact_page(
            &self,
            _list_id: u64,
            _count: u32,
            cursor: Option<&str>,
        ) -> Result<ContactPage, CrmError> {
            let next = match cursor {
                None | Some("b") => "a",
                _ => "b",
            };
            Ok(ContactPage {
                contacts: vec![contact("1", &[])],
                next_cursor: Some(next.to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_cursor_cycle_is_rejected() {
        let err = fetch_snapshot(&CyclingCursor, 7, 10, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, SyncError::Page { page: 3, ref cursor, .. } if cursor == "b"),
            "{err}"
        );
        assert!(err.to_string().contains("\"a\" repeats"), "{err}");
    }

    #[tokio::test]
    async fn test_resumed_walk_rejects_its_starting_cursor() {
        let mut pages = ContactPages::resume_from(&CyclingCursor, 7, 10, "a");
        assert!(pages.next_page().await.expect("page a").is_some());
        assert_eq!(pages.cursor(), Some("b"));
        assert!(pages.next_page().await.is_err(), "b points back to a");
    }

    #[test]
    fn test_duplicate_ids_resolve_to_first_record() {
        let snapshot = ExternalListSnapshot::from_contacts(
            1,
            vec![
                contact("1", &[("firstname", "First")]),
                contact("1", &[("firstname", "Second")]),
            ],
        );
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.get("1").and_then(|c| c.property("firstname")),
            Some("First")
        );
    }
}
