//! Source traits the fetcher drives.

use async_trait::async_trait;

use leadharvest_shared::{RawRecord, Result};

/// One page of directory listings for a query key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Cursor of the following page; `None` when this is the last one.
    pub next_cursor: Option<String>,
}

/// Contact details shown on a listing's detail view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailContact {
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// A paginated upstream directory.
#[async_trait]
pub trait DirectorySource: Send + Sync {
    /// Short adapter name for logs.
    fn name(&self) -> &str;

    /// Fetch the page of `key` at `cursor` (`None` = first page).
    async fn fetch_page(&self, key: &str, cursor: Option<&str>) -> Result<Page>;
}

/// Per-listing detail lookup.
#[async_trait]
pub trait DetailSource: Send + Sync {
    async fn fetch_detail(&self, external_id: &str) -> Result<Option<DetailContact>>;
}
