//! Generic incremental pagination over provider listings.

use chrono::{DateTime, Utc};
use std::future::Future;

use crate::providers::error::SyncError;

/// Opaque continuation token for a paginated provider listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageToken {
    /// 1-based page number or item offset.
    Offset(u64),
    /// Provider-issued opaque cursor string.
    Cursor(String),
    /// Discord snowflake id boundary.
    Snowflake(u64),
}

/// One page of a provider listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageToken>,
}

/// Ordering of items across pages, which decides whether the cutoff can halt
/// pagination early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    /// Items arrive newest first; the first item at or before the cutoff ends
    /// the scan.
    NewestFirst,
    /// Items arrive oldest first; every page must be consumed and items are
    /// only filtered.
    OldestFirst,
}

/// Fetch pages until the cutoff is reached, returning only items strictly
/// newer than `cutoff`.
///
/// `max_pages` bounds the scan regardless of ordering so a misbehaving
/// provider cannot drag a step into an unbounded crawl.
pub async fn fetch_until_cutoff<T, F, Fut>(
    first: PageToken,
    cutoff: DateTime<Utc>,
    max_pages: u32,
    order: ScanOrder,
    occurred_at: impl Fn(&T) -> DateTime<Utc>,
    mut fetch: F,
) -> Result<Vec<T>, SyncError>
where
    F: FnMut(PageToken) -> Fut,
    Fut: Future<Output = Result<Page<T>, SyncError>>,
{
    let mut collected = Vec::new();
    let mut token = Some(first);
    let mut pages_fetched = 0u32;

    while let Some(current) = token.take() {
        if pages_fetched >= max_pages {
            tracing::warn!(max_pages, "pagination guard reached, stopping scan");
            break;
        }
        pages_fetched += 1;

        let page = fetch(current).await?;
        let mut reached_cutoff = false;

        for item in page.items {
            if occurred_at(&item) > cutoff {
                collected.push(item);
            } else if order == ScanOrder::NewestFirst {
                reached_cutoff = true;
                break;
            }
        }

        if reached_cutoff {
            break;
        }
        token = page.next;
    }

    Ok(collected)
}
