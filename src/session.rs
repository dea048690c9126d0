//! Database Session - one open address-book file
//!
//! A `Session` is a cheap, clonable handle. Every clone refers to the same
//! engine store, schema tokens and reference count. Lifecycle changes (open,
//! close, force-close) are driven by `SessionManager`; everything else
//! (lookups, enumeration, write-back) lives here.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::Serialize;

use crate::cache::canonical_path;
use crate::card::{Card, Value, parse_yarn_number};
use crate::engine::{Oid, RowId, RowStore, Token};
use crate::materialize;
use crate::schema::{Field, SchemaTokens};
use crate::{Error, Result};

/// Row id of the internal data row holding book-wide values
const DATA_ROW_ID: RowId = 1;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Unopened,
    Opening,
    Open,
    Closing,
    Closed,
    /// Closed by a process-wide shutdown, regardless of holders
    ForceClosed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unopened => "unopened",
            SessionState::Opening => "opening",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::ForceClosed => "force-closed",
        };
        write!(f, "{}", s)
    }
}

/// Which rows `enumerate_cards` yields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardScope {
    /// Contact cards only
    #[default]
    Cards,
    /// Mailing lists only, as list cards
    Lists,
    /// Contacts and mailing lists, in table order
    All,
}

struct SessionCore {
    state: SessionState,
    refcount: usize,
    store: Option<Box<dyn RowStore>>,
}

struct SessionInner {
    path: PathBuf,
    tokens: OnceLock<SchemaTokens>,
    core: Mutex<SessionCore>,
}

/// Handle to one open address-book file
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.inner.path)
            .field("state", &self.state())
            .field("refcount", &self.refcount())
            .finish()
    }
}

impl Session {
    /// A session for `path` that has not been opened yet
    pub fn new(path: &Path) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                path: canonical_path(path),
                tokens: OnceLock::new(),
                core: Mutex::new(SessionCore {
                    state: SessionState::Unopened,
                    refcount: 0,
                    store: None,
                }),
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, SessionCore> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Canonical path of the database file
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn state(&self) -> SessionState {
        self.core().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Number of holders that have not closed yet
    pub fn refcount(&self) -> usize {
        self.core().refcount
    }

    pub fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Schema tokens, once the session has been initialized
    pub fn tokens(&self) -> Option<&SchemaTokens> {
        self.inner.tokens.get()
    }

    // ========== Lifecycle (driven by SessionManager) ==========

    /// Take ownership of a freshly opened store. Unopened -> Opening.
    pub(crate) fn begin_open(&self, store: Box<dyn RowStore>) {
        let mut core = self.core();
        core.state = SessionState::Opening;
        core.store = Some(store);
    }

    /// Resolve the schema tokens. Opening -> Open with one holder.
    ///
    /// On failure the store is dropped and the session ends up Closed.
    pub(crate) fn finish_open(&self) -> Result<()> {
        let mut core = self.core();
        let resolved = match core.store.as_mut() {
            Some(store) => SchemaTokens::initialize(store.as_mut()),
            None => Err(Error::SessionClosed),
        };

        match resolved {
            Ok(tokens) => {
                // Tokens are set exactly once per session.
                if self.inner.tokens.set(tokens).is_err() {
                    tracing::warn!("Schema tokens for {} were already resolved", self.path().display());
                }
                core.state = SessionState::Open;
                core.refcount = 1;
                Ok(())
            }
            Err(e) => {
                core.store = None;
                core.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    /// Add a holder to an open session
    pub(crate) fn acquire(&self) -> Result<()> {
        let mut core = self.core();
        if core.state != SessionState::Open {
            return Err(Error::SessionClosed);
        }
        core.refcount += 1;
        Ok(())
    }

    /// Drop a holder. The last one flushes (if asked), releases the store and
    /// closes the session. Returns true when the session closed.
    pub(crate) fn release(&self, force_commit: bool) -> Result<bool> {
        let mut core = self.core();
        if core.state != SessionState::Open {
            return Err(Error::SessionClosed);
        }
        core.refcount = core.refcount.saturating_sub(1);
        if core.refcount > 0 {
            return Ok(false);
        }

        core.state = SessionState::Closing;
        let mut store = core.store.take();
        let flushed = match store.as_mut() {
            Some(store) if force_commit => store.commit().map_err(Error::from),
            _ => Ok(()),
        };
        core.state = SessionState::Closed;
        flushed.map(|_| true)
    }

    /// Flush and close regardless of holders. Ends in ForceClosed even if the
    /// flush fails.
    pub(crate) fn force_close(&self) -> Result<()> {
        let mut core = self.core();
        let mut store = core.store.take();
        let flushed = match store.as_mut() {
            Some(store) if core.state == SessionState::Open => store.commit().map_err(Error::from),
            _ => Ok(()),
        };
        core.state = SessionState::ForceClosed;
        core.refcount = 0;
        flushed
    }

    /// Run `f` against the store of an open session
    pub(crate) fn with_store<T>(
        &self,
        f: impl FnOnce(&mut dyn RowStore, &SchemaTokens) -> Result<T>,
    ) -> Result<T> {
        let mut core = self.core();
        if core.state != SessionState::Open {
            return Err(Error::SessionClosed);
        }
        let tokens = self.inner.tokens.get().ok_or(Error::SessionClosed)?;
        let store = core.store.as_mut().ok_or(Error::SessionClosed)?;
        f(store.as_mut(), tokens)
    }

    fn scope(&self, pick: impl FnOnce(&SchemaTokens) -> Option<Token>) -> Result<Token> {
        let tokens = self.tokens().ok_or(Error::SessionClosed)?;
        pick(tokens).ok_or_else(|| Error::Engine("row scope unresolved".to_string()))
    }

    // ========== Row references ==========

    /// Locate a contact row. The row is not read until it is materialized.
    pub fn card_row(&self, row_id: RowId) -> Result<RowRef<'_>> {
        let scope = self.scope(SchemaTokens::card_scope)?;
        Ok(RowRef::new(self, Oid::new(scope, row_id)))
    }

    /// Locate a mailing-list row
    pub fn list_row(&self, row_id: RowId) -> Result<RowRef<'_>> {
        let scope = self.scope(SchemaTokens::list_scope)?;
        Ok(RowRef::new(self, Oid::new(scope, row_id)))
    }

    pub fn get_card_by_row_id(&self, row_id: RowId) -> Result<Card> {
        self.card_row(row_id)?.build_card(None)
    }

    pub fn get_list_by_row_id(&self, row_id: RowId) -> Result<Card> {
        self.list_row(row_id)?.build_list_card()
    }

    // ========== Enumeration ==========

    /// Lazily walk the address table in native order
    pub fn enumerate_cards(&self, scope: CardScope) -> CardEnumerator<'_> {
        CardEnumerator {
            session: self,
            scope,
            pos: 0,
            done: false,
        }
    }

    /// Lazily walk the members of a mailing list in member order
    pub fn enumerate_list_addresses(&self, list_row_id: RowId) -> Result<ListAddressEnumerator<'_>> {
        let list = self.list_row(list_row_id)?;
        let total = self.with_store(|store, tokens| {
            if !store.has_row(list.oid)? {
                return Err(Error::RowNotFound(list_row_id));
            }
            materialize::list_total(store, tokens, list.oid)
        })?;

        Ok(ListAddressEnumerator {
            list,
            total,
            pos: 0,
            done: false,
        })
    }

    /// Find a contact by primary or secondary email, ignoring case
    pub fn find_card_by_email(&self, email: &str) -> Result<Option<Card>> {
        for card in self.enumerate_cards(CardScope::Cards) {
            let card = card?;
            if card.has_email(email) {
                return Ok(Some(card));
            }
        }
        Ok(None)
    }

    /// Card and list counts of the address table
    pub fn stats(&self) -> Result<Stats> {
        self.with_store(|store, tokens| {
            let mut stats = Stats {
                path: self.path().display().to_string(),
                ..Stats::default()
            };
            let Some(table) = tokens.address_table() else {
                return Ok(stats);
            };
            for pos in 0..store.table_len(table)? {
                let Some(oid) = store.table_row_at(table, pos)? else {
                    break;
                };
                if tokens.is_card_scope(oid.scope) {
                    stats.cards += 1;
                } else if tokens.is_list_scope(oid.scope) {
                    stats.lists += 1;
                }
            }
            Ok(stats)
        })
    }

    // ========== Write-back ==========

    /// Store a new contact and return its row id
    pub fn add_card(&self, card: &Card) -> Result<RowId> {
        self.with_store(|store, tokens| {
            let scope = tokens.card_scope().ok_or(Error::SessionClosed)?;
            let table = tokens.address_table().ok_or(Error::SessionClosed)?;
            let row_id = next_record_key(store, tokens)?;
            let oid = Oid::new(scope, row_id);

            claim_row(store, tokens, table, oid)?;
            write_card_fields(store, tokens, oid, card, false)?;
            write_field(store, tokens, oid, Field::RecordKey, &Value::Number(row_id))?;
            tracing::debug!("Added card {} to {}", row_id, self.path().display());
            Ok(row_id)
        })
    }

    /// Rewrite the fields of an existing contact. Fields the card no longer
    /// holds are removed from the row.
    pub fn update_card(&self, card: &Card) -> Result<()> {
        let row = self.card_row(card.row_id)?;
        self.with_store(|store, tokens| {
            if !store.has_row(row.oid)? {
                return Err(Error::RowNotFound(card.row_id));
            }
            write_card_fields(store, tokens, row.oid, card, true)
        })
    }

    /// Store a new mailing list with `members` (contact row ids, in order)
    pub fn add_list(
        &self,
        name: &str,
        nick_name: &str,
        description: &str,
        members: &[RowId],
    ) -> Result<RowId> {
        self.with_store(|store, tokens| {
            let list_scope = tokens.list_scope().ok_or(Error::SessionClosed)?;
            let card_scope = tokens.card_scope().ok_or(Error::SessionClosed)?;
            let table = tokens.address_table().ok_or(Error::SessionClosed)?;
            let row_id = next_record_key(store, tokens)?;
            let oid = Oid::new(list_scope, row_id);

            claim_row(store, tokens, table, oid)?;
            let text = |s: &str| Value::Text(s.to_string());
            write_field(store, tokens, oid, Field::ListName, &text(name))?;
            write_field(store, tokens, oid, Field::LowercaseListName, &text(&name.to_lowercase()))?;
            write_field(store, tokens, oid, Field::ListNickName, &text(nick_name))?;
            write_field(store, tokens, oid, Field::ListDescription, &text(description))?;
            for member in members {
                store.push_member(oid, Oid::new(card_scope, *member))?;
            }
            let total = u32::try_from(members.len()).unwrap_or(u32::MAX);
            write_field(store, tokens, oid, Field::ListTotalAddresses, &Value::Number(total))?;
            Ok(row_id)
        })
    }

    /// Recount a list's members and store the result as its total
    pub fn write_list_total(&self, list_row_id: RowId) -> Result<u32> {
        let list = self.list_row(list_row_id)?;
        self.with_store(|store, tokens| {
            if !store.has_row(list.oid)? {
                return Err(Error::RowNotFound(list_row_id));
            }
            let total = materialize::recount_list_total(store, list.oid)?;
            write_field(store, tokens, list.oid, Field::ListTotalAddresses, &Value::Number(total))?;
            Ok(total)
        })
    }

    /// Flush pending changes without closing
    pub fn commit(&self) -> Result<()> {
        self.with_store(|store, _| Ok(store.commit()?))
    }
}

/// Write one field. Unresolved columns are skipped.
fn write_field(
    store: &mut dyn RowStore,
    tokens: &SchemaTokens,
    oid: Oid,
    field: Field,
    value: &Value,
) -> Result<()> {
    if let Some(column) = tokens.column(field) {
        store.set_cell(oid, column, &value.to_yarn())?;
    }
    Ok(())
}

/// Write the card's own fields and keep the lower-case email columns in step.
/// With `clear_missing`, card fields the card does not hold are removed.
fn write_card_fields(
    store: &mut dyn RowStore,
    tokens: &SchemaTokens,
    oid: Oid,
    card: &Card,
    clear_missing: bool,
) -> Result<()> {
    let lowercase_of = |field: Field| match field {
        Field::LowercasePrimaryEmail => Some(Field::PrimaryEmail),
        Field::LowercaseSecondEmail => Some(Field::SecondEmail),
        _ => None,
    };

    for field in Field::card_fields() {
        if field == Field::RecordKey {
            continue;
        }
        let Some(column) = tokens.column(field) else {
            continue;
        };
        if let Some(original) = lowercase_of(field) {
            if card.get(original).is_some() {
                let lowered = Value::Text(card.text(original).to_lowercase());
                store.set_cell(oid, column, &lowered.to_yarn())?;
            } else if clear_missing {
                store.remove_cell(oid, column)?;
            }
            continue;
        }
        match card.get(field) {
            Some(value) => store.set_cell(oid, column, &value.to_yarn())?,
            None if clear_missing => store.remove_cell(oid, column)?,
            None => {}
        }
    }
    Ok(())
}

/// Create a fresh row. Cards and lists share one record key space, and a key
/// already taken in either scope is never reused.
fn claim_row(store: &mut dyn RowStore, tokens: &SchemaTokens, table: Token, oid: Oid) -> Result<()> {
    for scope in [tokens.card_scope(), tokens.list_scope()].into_iter().flatten() {
        if store.has_row(Oid::new(scope, oid.id))? {
            return Err(Error::RowExists(oid.id));
        }
    }
    store.new_row(table, oid)?;
    Ok(())
}

/// Highest row id in use by a card or list
fn highest_record_key(store: &dyn RowStore, tokens: &SchemaTokens) -> Result<RowId> {
    let Some(table) = tokens.address_table() else {
        return Ok(0);
    };
    let mut highest = 0;
    for pos in 0..store.table_len(table)? {
        let Some(oid) = store.table_row_at(table, pos)? else {
            break;
        };
        if tokens.is_card_scope(oid.scope) || tokens.is_list_scope(oid.scope) {
            highest = highest.max(oid.id);
        }
    }
    Ok(highest)
}

/// Allocate the next record key from the data row, creating the row if needed
fn next_record_key(store: &mut dyn RowStore, tokens: &SchemaTokens) -> Result<RowId> {
    let scope = tokens.data_scope().ok_or(Error::SessionClosed)?;
    let table = tokens.address_table().ok_or(Error::SessionClosed)?;
    let column = tokens
        .column(Field::LastRecordKey)
        .ok_or(Error::SessionClosed)?;
    let data_row = Oid::new(scope, DATA_ROW_ID);

    if !store.has_row(data_row)? {
        store.new_row(table, data_row)?;
    }
    let last = match store.cell(data_row, column)? {
        None => 0,
        Some(yarn) => match parse_yarn_number(&yarn) {
            Some(last) => last,
            None => {
                let highest = highest_record_key(store, tokens)?;
                tracing::warn!(
                    "Unreadable record key {:?}, continuing after highest row {}",
                    yarn,
                    highest
                );
                highest
            }
        },
    };
    let next = last
        .checked_add(1)
        .ok_or_else(|| Error::Engine("record keys exhausted".to_string()))?;
    store.set_cell(data_row, column, &Value::Number(next).to_yarn())?;
    Ok(next)
}

/// Locator for one row, borrowed from its session
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'s> {
    session: &'s Session,
    oid: Oid,
}

impl<'s> RowRef<'s> {
    fn new(session: &'s Session, oid: Oid) -> Self {
        Self { session, oid }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn row_id(&self) -> RowId {
        self.oid.id
    }

    pub fn build_card(&self, owning_list: Option<RowId>) -> Result<Card> {
        self.session
            .with_store(|store, tokens| materialize::build_card(store, tokens, self.oid, owning_list))
    }

    pub fn build_list_card(&self) -> Result<Card> {
        self.session
            .with_store(|store, tokens| materialize::build_list_card(store, tokens, self.oid))
    }

    /// The member at `position` of this list row
    pub fn address_at(&self, position: u32) -> Result<RowRef<'s>> {
        let oid = self
            .session
            .with_store(|store, tokens| materialize::address_at(store, tokens, self.oid, position))?;
        Ok(RowRef::new(self.session, oid))
    }

    /// Stored member total, or a recount when none is stored. Read-only.
    pub fn list_total(&self) -> Result<u32> {
        self.session
            .with_store(|store, tokens| materialize::list_total(store, tokens, self.oid))
    }

    /// Member count ignoring the stored total. Read-only.
    pub fn recount_list_total(&self) -> Result<u32> {
        self.session
            .with_store(|store, _| materialize::recount_list_total(store, self.oid))
    }
}

enum Step {
    Yield(Card),
    Skip,
    End,
}

/// Iterator over the address table. Restart by calling `enumerate_cards` again.
pub struct CardEnumerator<'s> {
    session: &'s Session,
    scope: CardScope,
    pos: usize,
    done: bool,
}

impl CardEnumerator<'_> {
    fn step(&self, pos: usize) -> Result<Step> {
        let scope = self.scope;
        self.session.with_store(|store, tokens| {
            let Some(table) = tokens.address_table() else {
                return Ok(Step::End);
            };
            let Some(oid) = store.table_row_at(table, pos)? else {
                return Ok(Step::End);
            };

            let wants_cards = matches!(scope, CardScope::Cards | CardScope::All);
            let wants_lists = matches!(scope, CardScope::Lists | CardScope::All);
            let built = if wants_cards && tokens.is_card_scope(oid.scope) {
                materialize::build_card(store, tokens, oid, None)
            } else if wants_lists && tokens.is_list_scope(oid.scope) {
                materialize::build_list_card(store, tokens, oid)
            } else {
                return Ok(Step::Skip);
            };

            match built {
                Ok(card) => Ok(Step::Yield(card)),
                Err(e) if e.is_row_level() => {
                    tracing::warn!("Skipping row {}: {}", oid, e);
                    Ok(Step::Skip)
                }
                Err(e) => Err(e),
            }
        })
    }
}

impl Iterator for CardEnumerator<'_> {
    type Item = Result<Card>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let step = self.step(self.pos);
            self.pos += 1;
            match step {
                Ok(Step::Yield(card)) => return Some(Ok(card)),
                Ok(Step::Skip) => continue,
                Ok(Step::End) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Iterator over the members of one list, as cards
pub struct ListAddressEnumerator<'s> {
    list: RowRef<'s>,
    total: u32,
    pos: u32,
    done: bool,
}

impl ListAddressEnumerator<'_> {
    /// Member total the enumeration runs up to
    pub fn total(&self) -> u32 {
        self.total
    }
}

impl Iterator for ListAddressEnumerator<'_> {
    type Item = Result<Card>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.pos < self.total {
            let pos = self.pos;
            self.pos += 1;

            let card = self
                .list
                .address_at(pos)
                .and_then(|member| member.build_card(Some(self.list.row_id())));
            match card {
                Ok(card) => return Some(Ok(card)),
                Err(e) if e.is_row_level() => {
                    tracing::warn!("Skipping member {} of list {}: {}", pos, self.list.row_id(), e);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Counts of the address table
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub path: String,
    pub cards: usize,
    pub lists: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Address Book Statistics:")?;
        writeln!(f, "  Path: {}", self.path)?;
        writeln!(f, "  Cards: {}", self.cards)?;
        writeln!(f, "  Lists: {}", self.lists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryFactory;
    use crate::manager::{OpenOptions, SessionManager};
    use crate::recovery::RecoveryPolicy;

    fn open_book() -> (SessionManager, Session) {
        let manager = SessionManager::new(MemoryFactory::new());
        let session = manager
            .open("/books/session.mab", OpenOptions::create(), &RecoveryPolicy::Abort)
            .unwrap()
            .into_session();
        (manager, session)
    }

    fn add(session: &Session, first: &str, last: &str) -> RowId {
        let email = format!("{}@example.org", first.to_lowercase());
        session.add_card(&Card::contact(first, last, email)).unwrap()
    }

    #[test]
    fn test_card_round_trip_by_row_id() {
        let (_manager, session) = open_book();
        let card = Card::contact("Grace", "Hopper", "Grace@Navy.example")
            .with_text(Field::Company, "US Navy")
            .with_number(Field::PopularityIndex, 12);
        let row_id = session.add_card(&card).unwrap();

        let fetched = session.get_card_by_row_id(row_id).unwrap();
        assert_eq!(fetched.row_id, row_id);
        assert_eq!(fetched.number(Field::RecordKey), row_id);
        assert_eq!(fetched.display_name(), "Grace Hopper");
        assert_eq!(fetched.text(Field::Company), "US Navy");
        assert_eq!(fetched.text(Field::LowercasePrimaryEmail), "grace@navy.example");
        assert_eq!(fetched.popularity_index(), 12);
        assert_eq!(fetched.list_row_id, None);

        assert!(matches!(session.get_card_by_row_id(999), Err(Error::RowNotFound(999))));
    }

    #[test]
    fn test_record_keys_are_sequential() {
        let (_manager, session) = open_book();
        let a = add(&session, "Ada", "Lovelace");
        let b = add(&session, "Charles", "Babbage");
        let list = session.add_list("Engines", "", "", &[a, b]).unwrap();
        assert_eq!((a, b, list), (1, 2, 3));
    }

    #[test]
    fn test_enumerate_cards_by_scope() {
        let (_manager, session) = open_book();
        let a = add(&session, "Ada", "Lovelace");
        let b = add(&session, "Charles", "Babbage");
        let list = session.add_list("Engines", "eng", "Analytical", &[a, b]).unwrap();

        let cards: Vec<Card> = session
            .enumerate_cards(CardScope::Cards)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(cards.iter().map(|c| c.row_id).collect::<Vec<_>>(), vec![a, b]);
        assert!(cards.iter().all(|c| !c.is_mail_list));

        let lists: Vec<Card> = session
            .enumerate_cards(CardScope::Lists)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].row_id, list);
        assert_eq!(lists[0].list_total, Some(2));

        assert_eq!(session.enumerate_cards(CardScope::All).count(), 3);

        // Restartable: a fresh call scans again
        assert_eq!(session.enumerate_cards(CardScope::Cards).count(), 2);
    }

    #[test]
    fn test_enumerate_never_yields_non_card_rows() {
        let (_manager, session) = open_book();
        add(&session, "Ada", "Lovelace");
        session.add_list("Empty", "", "", &[]).unwrap();

        let tokens = session.tokens().unwrap().clone();
        let table = tokens.address_table().unwrap();
        for card in session.enumerate_cards(CardScope::Cards) {
            let card = card.unwrap();
            let scope = session
                .with_store(|store, _| {
                    let len = store.table_len(table)?;
                    let oid = (0..len)
                        .filter_map(|pos| store.table_row_at(table, pos).ok().flatten())
                        .find(|oid| oid.id == card.row_id && !tokens.is_data_scope(oid.scope))
                        .ok_or(Error::RowNotFound(card.row_id))?;
                    Ok(oid.scope)
                })
                .unwrap();
            assert!(tokens.is_card_scope(scope));
        }
    }

    #[test]
    fn test_list_with_dangling_member() {
        let (_manager, session) = open_book();
        let a = add(&session, "Ada", "Lovelace");
        let b = add(&session, "Charles", "Babbage");
        let list = session.add_list("Engines", "", "", &[a, 999, b]).unwrap();

        let list_row = session.list_row(list).unwrap();
        assert_eq!(list_row.list_total().unwrap(), 3);

        let members: Vec<Card> = session
            .enumerate_list_addresses(list)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(members.iter().map(|c| c.row_id).collect::<Vec<_>>(), vec![a, b]);
        assert!(members.iter().all(|c| c.list_row_id == Some(list)));
    }

    #[test]
    fn test_list_total_matches_address_at_after_recompute() {
        let (_manager, session) = open_book();
        let a = add(&session, "Ada", "Lovelace");
        let b = add(&session, "Charles", "Babbage");
        let list = session.add_list("Engines", "", "", &[a, b]).unwrap();
        let list_row = session.list_row(list).unwrap();

        // Make the stored total stale
        let column = session.tokens().unwrap().column(Field::ListTotalAddresses).unwrap();
        session
            .with_store(|store, _| Ok(store.set_cell(list_row.oid(), column, "5")?))
            .unwrap();
        assert_eq!(list_row.list_total().unwrap(), 5);
        assert_eq!(list_row.recount_list_total().unwrap(), 2);
        assert!(matches!(
            list_row.address_at(3),
            Err(Error::MemberMissing { position: 3, .. })
        ));

        // Reading never repairs; the explicit write-back does
        assert_eq!(list_row.list_total().unwrap(), 5);
        assert_eq!(session.write_list_total(list).unwrap(), 2);
        let total = list_row.list_total().unwrap();
        assert_eq!(total, 2);

        let successes = (0..)
            .map(|pos| list_row.address_at(pos))
            .take_while(|r| !matches!(r, Err(Error::IndexOutOfRange { .. })))
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(successes as u32, total);
    }

    #[test]
    fn test_enumerate_list_addresses_on_missing_list() {
        let (_manager, session) = open_book();
        assert!(matches!(
            session.enumerate_list_addresses(42),
            Err(Error::RowNotFound(42))
        ));
    }

    #[test]
    fn test_get_list_by_row_id() {
        let (_manager, session) = open_book();
        let a = add(&session, "Ada", "Lovelace");
        let list = session.add_list("Engine Club", "engines", "Analytical", &[a]).unwrap();

        let card = session.get_list_by_row_id(list).unwrap();
        assert!(card.is_mail_list);
        assert_eq!(card.display_name(), "Engine Club");
        assert_eq!(card.list_total, Some(1));
        assert!(session.get_list_by_row_id(a).is_err());
    }

    #[test]
    fn test_update_card_and_find_by_email() {
        let (_manager, session) = open_book();
        let id = add(&session, "Ada", "Lovelace");

        let mut card = session.get_card_by_row_id(id).unwrap();
        card.set_text(Field::SecondEmail, "Countess@Lovelace.example");
        card.set_text(Field::Notes, "First programmer");
        // Not persisted until written back
        assert_eq!(session.get_card_by_row_id(id).unwrap().text(Field::Notes), "");

        session.update_card(&card).unwrap();
        let found = session.find_card_by_email("countess@lovelace.EXAMPLE").unwrap().unwrap();
        assert_eq!(found.row_id, id);
        assert_eq!(found.text(Field::Notes), "First programmer");
        assert!(session.find_card_by_email("nobody@example.org").unwrap().is_none());

        let mut missing = Card::new();
        missing.row_id = 77;
        assert!(matches!(session.update_card(&missing), Err(Error::RowNotFound(77))));
    }

    fn set_last_record_key(session: &Session, yarn: &str) {
        let tokens = session.tokens().unwrap().clone();
        let data_row = Oid::new(tokens.data_scope().unwrap(), DATA_ROW_ID);
        let column = tokens.column(Field::LastRecordKey).unwrap();
        session
            .with_store(|store, _| Ok(store.set_cell(data_row, column, yarn)?))
            .unwrap();
    }

    #[test]
    fn test_unreadable_record_key_continues_after_highest_row() {
        let (_manager, session) = open_book();
        let ada = add(&session, "Ada", "Lovelace");
        let list = session.add_list("Engines", "", "", &[ada]).unwrap();

        set_last_record_key(&session, "zz");
        let bob = add(&session, "Bob", "Smith");
        assert_eq!(bob, list + 1);

        assert_eq!(session.get_card_by_row_id(ada).unwrap().display_name(), "Ada Lovelace");
        assert_eq!(session.get_card_by_row_id(bob).unwrap().display_name(), "Bob Smith");
        assert_eq!(session.enumerate_cards(CardScope::Cards).count(), 2);
    }

    #[test]
    fn test_stale_record_key_never_reuses_a_row() {
        let (_manager, session) = open_book();
        let ada = add(&session, "Ada", "Lovelace");

        set_last_record_key(&session, "0");
        let result = session.add_card(&Card::contact("Bob", "Smith", "bob@example.org"));
        assert!(matches!(result, Err(Error::RowExists(id)) if id == ada));
        set_last_record_key(&session, "0");
        assert!(matches!(
            session.add_list("Engines", "", "", &[]),
            Err(Error::RowExists(_))
        ));

        let card = session.get_card_by_row_id(ada).unwrap();
        assert_eq!(card.display_name(), "Ada Lovelace");
        assert_eq!(session.enumerate_cards(CardScope::All).count(), 1);
    }

    #[test]
    fn test_update_card_removes_cleared_fields() {
        let (_manager, session) = open_book();
        let id = add(&session, "Ada", "Lovelace");

        let mut card = session.get_card_by_row_id(id).unwrap();
        card.set_text(Field::Notes, "First programmer");
        card.set_text(Field::SecondEmail, "Countess@Lovelace.example");
        session.update_card(&card).unwrap();

        card.clear(Field::Notes);
        card.clear(Field::SecondEmail);
        session.update_card(&card).unwrap();

        let stored = session.get_card_by_row_id(id).unwrap();
        assert!(stored.get(Field::Notes).is_none());
        assert!(stored.get(Field::SecondEmail).is_none());
        assert!(stored.get(Field::LowercaseSecondEmail).is_none());
        assert_eq!(stored.number(Field::RecordKey), id);
        assert_eq!(stored.text(Field::LowercasePrimaryEmail), "ada@example.org");
        assert!(session.find_card_by_email("countess@lovelace.example").unwrap().is_none());
    }

    #[test]
    fn test_stats() {
        let (_manager, session) = open_book();
        let a = add(&session, "Ada", "Lovelace");
        add(&session, "Charles", "Babbage");
        session.add_list("Engines", "", "", &[a]).unwrap();

        let stats = session.stats().unwrap();
        assert_eq!((stats.cards, stats.lists), (2, 1));
        assert!(stats.to_string().contains("Cards: 2"));
    }
}
