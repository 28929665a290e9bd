//! Cursor-based read-only pagination over the durable store.
//!
//! A cursor pins its snapshot boundary at the store's highest seq when
//! it is first issued. Messages appended after that point never appear
//! anywhere in the cursor's page chain, and an item is returned at most
//! once: pages are stable under concurrent writes.

use crate::error::SphereResult;
use crate::message::Message;
use crate::store::{DurableStore, SharedStore};

/// Position in a forward-only page chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    /// Seq of the last returned item
    pub after_seq: u64,
    /// Snapshot boundary: items with a higher seq are invisible to
    /// this cursor chain
    pub snapshot_seq: u64,
}

/// One page of stored messages.
#[derive(Debug, Clone)]
pub struct Page {
    /// The items, in seq order
    pub items: Vec<Message>,
    /// Cursor for the next page, `None` once the snapshot is exhausted
    pub next_cursor: Option<PageCursor>,
}

/// Lazy, forward-only iterator over the store.
pub struct Pagger {
    store: SharedStore,
    page_size: usize,
}

impl Pagger {
    /// Create a pagger returning at most `page_size` items per page.
    pub fn new(store: SharedStore, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Fetch the next page. Pass `None` to start a new cursor chain,
    /// pinning the snapshot at the store's current high seq.
    pub async fn next_page(&self, cursor: Option<PageCursor>) -> SphereResult<Page> {
        let cursor = match cursor {
            Some(cursor) => cursor,
            None => PageCursor {
                after_seq: 0,
                snapshot_seq: self.store.high_seq().await?,
            },
        };

        let items = self
            .store
            .scan(cursor.after_seq, cursor.snapshot_seq, self.page_size)
            .await?;

        let next_cursor = match items.last() {
            Some(last) if items.len() == self.page_size && last.seq < cursor.snapshot_seq => {
                Some(PageCursor {
                    after_seq: last.seq,
                    snapshot_seq: cursor.snapshot_seq,
                })
            }
            _ => None,
        };

        Ok(Page { items, next_cursor })
    }
}
