//! Cursor-driven pagination over list endpoints.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

/// Position in a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Start,
    Marker(String),
    Offset(usize),
}

/// How the next cursor is derived from a page.
#[derive(Debug, Clone, Copy)]
pub enum CursorStyle {
    /// Opaque marker built from the last record of the page.
    Marker(fn(&Value) -> Option<String>),
    /// Numeric offset advanced by the page length.
    Offset,
}

/// Something that can return one page at a cursor.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, cursor: &Cursor, limit: usize) -> Result<Vec<Value>>;
}

/// One page of records.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<Value>,
    /// No further pages follow.
    pub done: bool,
}

/// Walks a [`PageSource`] until a short or empty page.
pub struct Pager<S> {
    source: S,
    style: CursorStyle,
    limit: usize,
    cursor: Cursor,
    done: bool,
}

impl<S: PageSource> Pager<S> {
    pub fn new(source: S, style: CursorStyle, limit: usize) -> Self {
        Self { source, style, limit: limit.max(1), cursor: Cursor::Start, done: false }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetch the next page. Once a page reports `done`, later calls return
    /// an empty done page without touching the source.
    pub async fn next_page(&mut self) -> Result<Page> {
        if self.done {
            return Ok(Page { records: Vec::new(), done: true });
        }

        let records = self.source.fetch(&self.cursor, self.limit).await?;
        let mut done = records.len() < self.limit;

        if !done {
            match self.style {
                CursorStyle::Offset => {
                    let offset = match self.cursor {
                        Cursor::Offset(n) => n,
                        _ => 0,
                    };
                    self.cursor = Cursor::Offset(offset + records.len());
                }
                CursorStyle::Marker(marker) => match records.last().and_then(marker) {
                    Some(m) => self.cursor = Cursor::Marker(m),
                    None => {
                        warn!("Last record of a full page has no marker, ending pagination");
                        done = true;
                    }
                },
            }
        }

        self.done = done;
        Ok(Page { records, done })
    }
}
