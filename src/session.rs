//! Per-user session: who is signed in, and the table fetched for them.
//!
//! A session starts anonymous. Logging in moves it to authenticated; logging
//! out clears the identity and the cached table. The table is fetched at most
//! once per session unless invalidated, and at most one fetch may be in
//! flight at a time.
//!
//! Callers that own the session for the whole fetch use [`Session::load_table`].
//! Callers that must release a lock around the network call use the
//! [`Session::begin_fetch`] / [`Session::finish_fetch`] pair instead.

use log::{info, warn};
use std::sync::Arc;

use crate::downloader::{Download, csv_download};
use crate::error::{Result, ScreenerError};
use crate::loader::TableSource;
use crate::login::{CredentialStore, LoginOutcome};
use crate::search::{FilteredView, filter};
use crate::table::Table;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Anonymous,
    Authenticated { identifier: String },
}

/// Proof that a fetch was started; required to store its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
}

#[derive(Debug)]
pub struct Session {
    state: GateState,
    table: Option<Arc<Table>>,
    loading: bool,
    // Bumped on logout/login so fetches started earlier are discarded.
    generation: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Session {
            state: GateState::Anonymous,
            table: None,
            loading: false,
            generation: 0,
        }
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, GateState::Authenticated { .. })
    }

    /// Normalized identifier of the signed-in user.
    pub fn identifier(&self) -> Option<&str> {
        match &self.state {
            GateState::Authenticated { identifier } => Some(identifier),
            GateState::Anonymous => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn has_table(&self) -> bool {
        self.table.is_some()
    }

    /// Check credentials and sign in on success.
    ///
    /// A failed attempt leaves the session as it was. Signing in as a
    /// different user discards the previous user's table.
    pub fn attempt_login(
        &mut self,
        store: &CredentialStore,
        identifier: &str,
        secret: &str,
    ) -> LoginOutcome {
        let outcome = store.verify(identifier, secret);
        if let LoginOutcome::Granted(key) = &outcome {
            if self.identifier() != Some(key.as_str()) {
                self.reset();
            }
            self.state = GateState::Authenticated {
                identifier: key.clone(),
            };
        }
        outcome
    }

    /// Like [`Session::attempt_login`], but takes the credential store as
    /// loaded from configuration so a missing `[auth]` section surfaces as a
    /// configuration error rather than a denied login.
    pub fn login_with(
        &mut self,
        store: Result<&CredentialStore>,
        identifier: &str,
        secret: &str,
    ) -> Result<LoginOutcome> {
        Ok(self.attempt_login(store?, identifier, secret))
    }

    pub fn logout(&mut self) {
        if let Some(identifier) = self.identifier() {
            info!("{} signed out", identifier);
        }
        self.reset();
        self.state = GateState::Anonymous;
    }

    fn reset(&mut self) {
        self.table = None;
        self.loading = false;
        self.generation += 1;
    }

    fn ensure_authenticated(&self) -> Result<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(ScreenerError::Unauthenticated)
        }
    }

    /// Drop the cached table so the next read fetches again.
    pub fn invalidate(&mut self) -> Result<()> {
        self.ensure_authenticated()?;
        self.table = None;
        Ok(())
    }

    /// The cached table.
    ///
    /// # Errors
    /// * `Unauthenticated` while signed out
    /// * `TableNotLoaded` before the first successful fetch
    pub fn table(&self) -> Result<&Table> {
        self.ensure_authenticated()?;
        self.table.as_deref().ok_or(ScreenerError::TableNotLoaded)
    }

    /// Shared handle to the cached table, for callers that drop the session
    /// lock before searching.
    pub fn shared_table(&self) -> Result<Arc<Table>> {
        self.ensure_authenticated()?;
        self.table.clone().ok_or(ScreenerError::TableNotLoaded)
    }

    /// Mark a fetch as in flight.
    ///
    /// # Errors
    /// * `Unauthenticated` while signed out
    /// * `FetchInProgress` if another fetch has not finished yet
    pub fn begin_fetch(&mut self) -> Result<FetchTicket> {
        self.ensure_authenticated()?;
        if self.loading {
            return Err(ScreenerError::FetchInProgress);
        }
        self.loading = true;
        Ok(FetchTicket {
            generation: self.generation,
        })
    }

    /// Record the outcome of a fetch started with [`Session::begin_fetch`].
    ///
    /// A success replaces the cached table. A failure keeps whatever was
    /// cached before. Results for a ticket issued before a logout (or a login
    /// as someone else) are discarded and reported as `Unauthenticated`.
    pub fn finish_fetch(&mut self, ticket: FetchTicket, result: Result<Table>) -> Result<&Table> {
        if ticket.generation != self.generation {
            warn!("discarding fetch result from an ended session");
            return Err(ScreenerError::Unauthenticated);
        }
        self.loading = false;

        match result {
            Ok(table) => {
                self.table = Some(Arc::new(table));
                self.table()
            }
            Err(e) => {
                warn!("sheet fetch failed: {}", e);
                Err(e)
            }
        }
    }

    /// Fetch the table unless one is already cached.
    pub async fn load_table<S>(&mut self, source: &S, source_name: &str) -> Result<&Table>
    where
        S: TableSource + ?Sized,
    {
        self.ensure_authenticated()?;
        if self.table.is_some() {
            return self.table();
        }
        self.refresh(source, source_name).await
    }

    /// Give up on a fetch that will never be finished.
    ///
    /// Clears the in-flight mark so the next read can fetch again. Tickets
    /// from an earlier generation are ignored.
    pub fn abandon_fetch(&mut self, ticket: FetchTicket) {
        if ticket.generation == self.generation && self.loading {
            warn!("sheet fetch abandoned before it finished");
            self.loading = false;
        }
    }

    /// Fetch the table again. On failure the previously cached table, if
    /// any, stays in place. Dropping the returned future mid-fetch abandons
    /// the fetch.
    pub async fn refresh<S>(&mut self, source: &S, source_name: &str) -> Result<&Table>
    where
        S: TableSource + ?Sized,
    {
        let ticket = self.begin_fetch()?;
        let mut in_flight = InFlight {
            session: Some(self),
            ticket,
        };
        let result = source.fetch_table(source_name).await;
        match in_flight.session.take() {
            Some(session) => session.finish_fetch(ticket, result),
            None => Err(ScreenerError::Unauthenticated),
        }
    }

    /// Search the cached table.
    pub fn search(&self, query: &str) -> Result<FilteredView<'_>> {
        Ok(filter(self.table()?, query))
    }

    /// CSV download of the cached table, filtered by `query`.
    pub fn export(&self, query: &str) -> Result<Download> {
        let view = self.search(query)?;
        Ok(csv_download(&view, query))
    }
}

/// Abandons its fetch on drop unless the session was taken back to finish it.
struct InFlight<'a> {
    session: Option<&'a mut Session>,
    ticket: FetchTicket,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.abandon_fetch(self.ticket);
        }
    }
}
