//! Debounced, paginated feed state machine.
//!
//! The controller performs no I/O. Intents and [`FeedController::poll`] hand out
//! [`FetchTicket`]s; the owner runs them against a catalog client and reports back through
//! [`FeedController::on_page`]. Only the outstanding ticket of the active feed is ever merged.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::types::{CatalogEntry, EntryId, Filters, Page, Query, RequestToken, SortOrder};

/// Quiet period before a search edit is committed.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    pub debounce: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { debounce: DEFAULT_DEBOUNCE }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedIntent {
    SetSearchText(String),
    SetFilters(Filters),
    SetSort(SortOrder),
    RequestNextPage,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Idle,
    Debouncing,
    Fetching,
    Settled,
    Error,
}

/// A catalog fetch the owner must execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub token: RequestToken,
    pub query: Query,
}

/// Last failure of the active feed, with the query that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedError {
    pub query: Query,
    pub error: CoreError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { added: usize, duplicates: usize, replaced: bool, has_more: bool },
    Stale,
    Failed,
}

#[derive(Debug)]
pub struct FeedController {
    config: FeedConfig,
    active: Query,
    staged: Option<Query>,
    deadline: Option<Instant>,
    outstanding: Option<FetchTicket>,
    /// Fetch of the active feed dropped by a filter or sort change that may yet be undone.
    abandoned: Option<Query>,
    next_token: u64,
    entries: Vec<CatalogEntry>,
    seen: HashSet<EntryId>,
    /// Highest page merged for the active feed; 0 until page 1 arrives.
    loaded_page: u32,
    has_more: bool,
    last_error: Option<FeedError>,
}

impl FeedController {
    /// Starts on the default query with nothing loaded.
    pub fn new(config: FeedConfig) -> Self {
        Self::with_query(config, Query::default())
    }

    /// Start from a restored query. Nothing is fetched until the first `RequestNextPage`.
    pub fn with_query(config: FeedConfig, query: Query) -> Self {
        Self {
            config,
            active: query.with_page(1),
            staged: None,
            deadline: None,
            outstanding: None,
            abandoned: None,
            next_token: 0,
            entries: Vec::new(),
            seen: HashSet::new(),
            loaded_page: 0,
            has_more: false,
            last_error: None,
        }
    }

    /// Phase derived from the pending debounce, fetch, and last result.
    pub fn state(&self) -> FeedState {
        if self.deadline.is_some() {
            FeedState::Debouncing
        } else if self.outstanding.is_some() {
            FeedState::Fetching
        } else if self.last_error.is_some() {
            FeedState::Error
        } else if self.loaded_page > 0 {
            FeedState::Settled
        } else {
            FeedState::Idle
        }
    }

    /// The committed query; its page is the last merged cursor.
    pub fn query(&self) -> &Query {
        &self.active
    }

    /// Query waiting for the debounce to expire, if any.
    pub fn staged(&self) -> Option<&Query> {
        self.staged.as_ref()
    }

    /// Displayed entries in merge order, without duplicates.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Whether the catalog reported a page after the last merged one.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Failure of the latest fetch; cleared by the next successful merge.
    pub fn last_error(&self) -> Option<&FeedError> {
        self.last_error.as_ref()
    }

    /// Ticket whose result would currently be merged.
    pub fn outstanding(&self) -> Option<&FetchTicket> {
        self.outstanding.as_ref()
    }

    /// When [`poll`](Self::poll) should next be called, if a debounce is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Apply a user intent. Returns a ticket when a fetch must start right away.
    pub fn submit_intent(&mut self, intent: FeedIntent, now: Instant) -> Option<FetchTicket> {
        debug!(?intent, "feed intent");
        match intent {
            FeedIntent::SetSearchText(text) => {
                let mut next = self.target().clone();
                next.search = text;
                self.staged = Some(next.with_page(1));
                self.deadline = Some(now + self.config.debounce);
                None
            }
            FeedIntent::SetFilters(filters) => {
                let target = self.target();
                if target.filters == filters {
                    return None;
                }
                let next = Query { filters, ..target.with_page(1) };
                self.change_immediately(next, now)
            }
            FeedIntent::SetSort(sort) => {
                let target = self.target();
                if target.sort == sort {
                    return None;
                }
                let next = Query { sort, ..target.with_page(1) };
                self.change_immediately(next, now)
            }
            FeedIntent::RequestNextPage => self.next_page(),
            FeedIntent::Reset => {
                self.staged = None;
                self.deadline = None;
                self.loaded_page = 0;
                self.has_more = false;
                info!(search = %self.active.search, "feed reset");
                Some(self.issue(self.active.with_page(1)))
            }
        }
    }

    /// Commit the staged query once its debounce has expired.
    pub fn poll(&mut self, now: Instant) -> Option<FetchTicket> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                let staged = self.staged.take()?;
                self.commit(staged)
            }
            _ => None,
        }
    }

    /// Report the result of a ticket. Results for anything but the outstanding ticket of the
    /// active feed are dropped.
    pub fn on_page(
        &mut self,
        token: RequestToken,
        result: Result<Page, CoreError>,
    ) -> MergeOutcome {
        let current = self.outstanding.as_ref().is_some_and(|ticket| ticket.token == token);
        if !current {
            debug!(token = token.as_u64(), "dropping stale page result");
            return MergeOutcome::Stale;
        }
        let Some(ticket) = self.outstanding.take() else {
            return MergeOutcome::Stale;
        };
        if !ticket.query.same_feed(&self.active) {
            debug!(token = token.as_u64(), "dropping page for a superseded feed");
            return MergeOutcome::Stale;
        }

        match result {
            Ok(page) => self.merge(ticket.query, page),
            Err(error) => {
                warn!(page = ticket.query.page, %error, "feed fetch failed");
                self.last_error = Some(FeedError { query: ticket.query, error });
                MergeOutcome::Failed
            }
        }
    }

    fn target(&self) -> &Query {
        self.staged.as_ref().unwrap_or(&self.active)
    }

    /// Filter and sort changes commit at once unless a fetch or debounce is pending, in which
    /// case the pending fetch is abandoned and the debounce restarted so bursts coalesce.
    fn change_immediately(&mut self, next: Query, now: Instant) -> Option<FetchTicket> {
        if self.deadline.is_some() || self.outstanding.is_some() {
            if let Some(ticket) = self.outstanding.take() {
                self.abandoned = Some(ticket.query);
            }
            self.staged = Some(next);
            self.deadline = Some(now + self.config.debounce);
            return None;
        }
        self.commit(next)
    }

    fn commit(&mut self, query: Query) -> Option<FetchTicket> {
        self.staged = None;
        self.deadline = None;
        if query.same_feed(&self.active) && (self.loaded_page > 0 || self.outstanding.is_some()) {
            debug!("commit matches the active feed");
            let resume = self.abandoned.take().filter(|pending| pending.same_feed(&self.active));
            return match resume {
                Some(pending) if self.outstanding.is_none() => Some(self.issue(pending)),
                _ => None,
            };
        }
        info!(search = %query.search, sort = ?query.sort, "committing feed query");
        self.active = query.with_page(1);
        self.loaded_page = 0;
        self.has_more = false;
        Some(self.issue(self.active.clone()))
    }

    fn next_page(&mut self) -> Option<FetchTicket> {
        if self.deadline.is_some() || self.outstanding.is_some() {
            return None;
        }
        if self.loaded_page == 0 {
            return Some(self.issue(self.active.with_page(1)));
        }
        if !self.has_more {
            return None;
        }
        Some(self.issue(self.active.with_page(self.loaded_page + 1)))
    }

    fn issue(&mut self, query: Query) -> FetchTicket {
        self.next_token += 1;
        self.abandoned = None;
        let ticket = FetchTicket { token: RequestToken::new(self.next_token), query };
        debug!(token = self.next_token, page = ticket.query.page, "issuing fetch");
        self.outstanding = Some(ticket.clone());
        ticket
    }

    fn merge(&mut self, query: Query, page: Page) -> MergeOutcome {
        let replaced = query.page == 1;
        if replaced {
            self.entries.clear();
            self.seen.clear();
        }

        let mut added = 0;
        let mut duplicates = 0;
        for entry in page.entries {
            if self.seen.insert(entry.id.clone()) {
                self.entries.push(entry);
                added += 1;
            } else {
                duplicates += 1;
            }
        }

        self.loaded_page = query.page;
        self.active.page = query.page;
        self.has_more = page.has_more;
        self.last_error = None;
        debug!(page = query.page, added, duplicates, has_more = page.has_more, "merged page");
        MergeOutcome::Merged { added, duplicates, replaced, has_more: page.has_more }
    }
}
