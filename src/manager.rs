//! Session Manager - open/close lifecycle over the handle cache
//!
//! The manager owns the `HandleCache` and the `StoreFactory`. It is the only
//! place sessions are opened, shared, closed or force-closed. Nothing here is
//! global: each manager is an independent registry, so tests get a fresh one.

use std::path::Path;

use crate::cache::{HandleCache, canonical_path};
use crate::engine::{RowStore, SqliteFactory, StoreError, StoreFactory};
use crate::recovery::{CorruptionReport, RecoveryDecision, RecoveryHandler, backup_path_for};
use crate::session::{Session, SessionState};
use crate::{Error, Result};

/// Options for `SessionManager::open`
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Create an empty store when none exists
    pub create_if_missing: bool,
}

impl OpenOptions {
    pub fn existing() -> Self {
        Self {
            create_if_missing: false,
        }
    }

    pub fn create() -> Self {
        Self {
            create_if_missing: true,
        }
    }
}

/// Result of a successful open
#[derive(Debug)]
pub enum Opened {
    /// The session, new or shared from the cache
    Ready(Session),
    /// The file was corrupt; it was moved aside and a fresh store created
    Recovered {
        session: Session,
        report: CorruptionReport,
    },
}

impl Opened {
    pub fn session(&self) -> &Session {
        match self {
            Opened::Ready(session) => session,
            Opened::Recovered { session, .. } => session,
        }
    }

    pub fn into_session(self) -> Session {
        match self {
            Opened::Ready(session) => session,
            Opened::Recovered { session, .. } => session,
        }
    }

    pub fn recovery(&self) -> Option<&CorruptionReport> {
        match self {
            Opened::Ready(_) => None,
            Opened::Recovered { report, .. } => Some(report),
        }
    }
}

/// Opens and shares address-book sessions
pub struct SessionManager {
    factory: Box<dyn StoreFactory>,
    cache: HandleCache,
}

impl SessionManager {
    pub fn new(factory: impl StoreFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            cache: HandleCache::new(),
        }
    }

    /// Manager over SQLite files on disk
    pub fn sqlite() -> Self {
        Self::new(SqliteFactory)
    }

    pub fn cache(&self) -> &HandleCache {
        &self.cache
    }

    /// Open the address book at `path`, or share the session already open for it.
    ///
    /// `recovery` is only consulted when the store is corrupt.
    pub fn open(
        &self,
        path: impl AsRef<Path>,
        options: OpenOptions,
        recovery: &dyn RecoveryHandler,
    ) -> Result<Opened> {
        let path = canonical_path(path.as_ref());

        if let Some(session) = self.cache.find(&path) {
            session.acquire()?;
            tracing::debug!(
                "Sharing session for {} (refcount {})",
                path.display(),
                session.refcount()
            );
            return Ok(Opened::Ready(session));
        }

        let store = match self.factory.open(&path, options.create_if_missing) {
            Ok(store) => store,
            Err(StoreError::Corrupt(_, reason)) => {
                tracing::warn!("Address book {} is corrupt: {}", path.display(), reason);
                return self.recover(&path, recovery);
            }
            Err(StoreError::Locked(_)) => {
                tracing::warn!("Address book {} is locked", path.display());
                return Err(Error::Locked(path));
            }
            Err(e) => return Err(e.into()),
        };

        let session = self.install(&path, store)?;
        tracing::info!("Opened address book {}", path.display());
        Ok(Opened::Ready(session))
    }

    /// Build a session around an opened store and register it
    fn install(&self, path: &Path, store: Box<dyn RowStore>) -> Result<Session> {
        let session = Session::new(path);
        session.begin_open(store);
        session.finish_open()?;
        self.cache.register(&session)?;
        Ok(session)
    }

    /// Ask the caller, then move the damaged file aside and start over
    fn recover(&self, path: &Path, recovery: &dyn RecoveryHandler) -> Result<Opened> {
        let report = CorruptionReport {
            path: path.to_path_buf(),
            backup_path: backup_path_for(path, |p| self.factory.exists(p)),
        };

        if recovery.on_corrupt(&report) == RecoveryDecision::Abort {
            return Err(Error::Corrupt {
                path: report.path,
                backup_path: report.backup_path,
            });
        }

        self.factory.rename_aside(&report.path, &report.backup_path)?;
        tracing::info!(
            "Moved corrupt address book {} to {}",
            report.path.display(),
            report.backup_path.display()
        );

        let store = self.factory.open(path, true)?;
        let session = self.install(path, store)?;
        Ok(Opened::Recovered { session, report })
    }

    /// Release one holder of `session`. The last holder flushes (when
    /// `force_commit`) and unregisters it.
    pub fn close(&self, session: &Session, force_commit: bool) -> Result<()> {
        let result = session.release(force_commit);
        if session.state() != SessionState::Open {
            self.cache.remove(session);
        }
        if let Ok(true) = result {
            tracing::info!("Closed address book {}", session.path().display());
        }
        result.map(|_| ())
    }

    /// Flush and close every cached session regardless of holders.
    ///
    /// Only for shutdown: remaining holders see `SessionClosed` from then on.
    /// Returns the number of sessions closed.
    pub fn force_close_all(&self) -> usize {
        let sessions = self.cache.clear_all();
        for session in &sessions {
            if let Err(e) = session.force_close() {
                tracing::warn!("Flush failed while force-closing {}: {}", session.path().display(), e);
            }
        }
        if !sessions.is_empty() {
            tracing::info!("Force-closed {} address book(s)", sessions.len());
        }
        sessions.len()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.force_close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::Card;
    use crate::engine::{MemoryFactory, Oid};
    use crate::schema::Field;
    use crate::session::CardScope;
    use std::path::PathBuf;

    const BOOK: &str = "/books/abook.mab";

    fn abort(_: &CorruptionReport) -> RecoveryDecision {
        RecoveryDecision::Abort
    }

    fn recreate(_: &CorruptionReport) -> RecoveryDecision {
        RecoveryDecision::Recreate
    }

    fn manager() -> (SessionManager, MemoryFactory) {
        let factory = MemoryFactory::new();
        (SessionManager::new(factory.clone()), factory)
    }

    fn open_new(manager: &SessionManager) -> Session {
        manager
            .open(BOOK, OpenOptions::create(), &abort)
            .unwrap()
            .into_session()
    }

    #[test]
    fn test_missing_book_without_create() {
        let (manager, _) = manager();
        assert!(matches!(
            manager.open(BOOK, OpenOptions::existing(), &abort),
            Err(Error::NotFound(_))
        ));

        let session = open_new(&manager);
        assert!(session.is_open());
        assert_eq!(session.enumerate_cards(CardScope::All).count(), 0);
    }

    #[test]
    fn test_repeated_opens_share_one_session() {
        let (manager, _) = manager();
        let first = open_new(&manager);
        let second = manager
            .open("/books/../books/abook.mab", OpenOptions::existing(), &abort)
            .unwrap()
            .into_session();
        let third = open_new(&manager);

        assert!(first.same_session(&second));
        assert!(first.same_session(&third));
        assert_eq!(first.refcount(), 3);
        assert_eq!(manager.cache().len(), 1);
    }

    #[test]
    fn test_only_last_close_flushes() {
        let (manager, factory) = manager();
        let path = PathBuf::from(BOOK);
        let first = open_new(&manager);
        let second = open_new(&manager);

        first.add_card(&Card::contact("Ada", "Lovelace", "ada@example.org")).unwrap();

        manager.close(&first, true).unwrap();
        assert_eq!(factory.commits(&path), 0);
        assert!(second.is_open());
        assert_eq!(second.refcount(), 1);
        assert_eq!(second.enumerate_cards(CardScope::Cards).count(), 1);

        manager.close(&second, true).unwrap();
        assert_eq!(factory.commits(&path), 1);
        assert_eq!(second.state(), SessionState::Closed);
        assert!(manager.cache().is_empty());
        assert!(matches!(manager.close(&second, true), Err(Error::SessionClosed)));

        // The committed card is there for the next session
        let reopened = manager
            .open(BOOK, OpenOptions::existing(), &abort)
            .unwrap()
            .into_session();
        assert!(!reopened.same_session(&first));
        assert_eq!(reopened.enumerate_cards(CardScope::Cards).count(), 1);
    }

    #[test]
    fn test_close_without_commit_discards_changes() {
        let (manager, factory) = manager();
        let session = open_new(&manager);
        session.add_card(&Card::contact("Ada", "Lovelace", "ada@example.org")).unwrap();
        manager.close(&session, false).unwrap();
        assert_eq!(factory.commits(Path::new(BOOK)), 0);

        let reopened = open_new(&manager);
        assert_eq!(reopened.enumerate_cards(CardScope::Cards).count(), 0);
    }

    #[test]
    fn test_locked_book_fails_without_retry() {
        let (manager, factory) = manager();
        let session = open_new(&manager);
        manager.close(&session, true).unwrap();

        factory.set_locked(Path::new(BOOK), true);
        assert!(matches!(
            manager.open(BOOK, OpenOptions::existing(), &abort),
            Err(Error::Locked(_))
        ));
        assert!(manager.cache().is_empty());

        factory.set_locked(Path::new(BOOK), false);
        assert!(manager.open(BOOK, OpenOptions::existing(), &abort).is_ok());
    }

    #[test]
    fn test_second_manager_is_locked_out_while_open() {
        let (manager, factory) = manager();
        let session = open_new(&manager);
        session.add_card(&Card::contact("Ada", "Lovelace", "ada@example.org")).unwrap();

        let other = SessionManager::new(factory.clone());
        assert!(matches!(
            other.open(BOOK, OpenOptions::existing(), &abort),
            Err(Error::Locked(_))
        ));
        assert!(other.cache().is_empty());

        manager.close(&session, true).unwrap();
        let reopened = other
            .open(BOOK, OpenOptions::existing(), &abort)
            .unwrap()
            .into_session();
        assert_eq!(reopened.enumerate_cards(CardScope::Cards).count(), 1);
        other.close(&reopened, false).unwrap();
    }

    #[test]
    fn test_corrupt_book_declined_is_left_alone() {
        let (manager, factory) = manager();
        factory.set_corrupt(Path::new(BOOK));

        match manager.open(BOOK, OpenOptions::existing(), &abort) {
            Err(Error::Corrupt { path, backup_path }) => {
                assert_eq!(path, PathBuf::from(BOOK));
                assert_eq!(backup_path, PathBuf::from("/books/abook.mab.bak"));
            }
            other => panic!("expected Corrupt, got {:?}", other),
        }
        assert!(factory.is_corrupt(Path::new(BOOK)));
        assert!(!factory.exists(Path::new("/books/abook.mab.bak")));
    }

    #[test]
    fn test_corrupt_book_recovered_fresh() {
        let (manager, factory) = manager();
        factory.set_corrupt(Path::new(BOOK));
        factory.set_corrupt(Path::new("/books/abook.mab.bak"));

        let opened = manager.open(BOOK, OpenOptions::existing(), &recreate).unwrap();
        let report = opened.recovery().cloned().unwrap();
        assert_eq!(report.backup_path, PathBuf::from("/books/abook.mab.bak.1"));

        let session = opened.into_session();
        assert!(session.is_open());
        assert_eq!(session.enumerate_cards(CardScope::All).count(), 0);
        assert!(factory.is_corrupt(&report.backup_path));
        assert!(!factory.is_corrupt(Path::new(BOOK)));
    }

    #[test]
    fn test_schema_failure_returns_no_session() {
        let (manager, factory) = manager();
        factory.fail_token(Path::new(BOOK), Field::PopularityIndex.name());

        assert!(matches!(
            manager.open(BOOK, OpenOptions::create(), &abort),
            Err(Error::SchemaInitFailed { .. })
        ));
        assert!(manager.cache().is_empty());
    }

    #[test]
    fn test_force_close_all_ends_enumeration() {
        let (manager, factory) = manager();
        let session = open_new(&manager);
        let _holder = open_new(&manager);
        session.add_card(&Card::contact("Ada", "Lovelace", "ada@example.org")).unwrap();
        session.add_card(&Card::contact("Charles", "Babbage", "cb@example.org")).unwrap();

        let mut cards = session.enumerate_cards(CardScope::Cards);
        assert!(cards.next().unwrap().is_ok());

        assert_eq!(manager.force_close_all(), 1);
        assert_eq!(session.state(), SessionState::ForceClosed);
        assert_eq!(factory.commits(Path::new(BOOK)), 1);
        assert!(manager.cache().is_empty());

        assert!(matches!(cards.next(), Some(Err(Error::SessionClosed))));
        assert!(cards.next().is_none());
        assert!(matches!(session.get_card_by_row_id(1), Err(Error::SessionClosed)));
    }

    #[test]
    fn test_corrupt_rows_are_skipped_during_enumeration() {
        let (manager, factory) = manager();
        let session = open_new(&manager);
        let ada = session.add_card(&Card::contact("Ada", "Lovelace", "ada@example.org")).unwrap();
        let bad = session.add_card(&Card::contact("Bad", "Row", "bad@example.org")).unwrap();

        let scope = session.tokens().unwrap().card_scope().unwrap();
        factory.poison_row(Path::new(BOOK), Oid::new(scope, bad));

        let ids: Vec<u32> = session
            .enumerate_cards(CardScope::Cards)
            .map(|card| card.unwrap().row_id)
            .collect();
        assert_eq!(ids, vec![ada]);

        // Direct lookup surfaces the corruption
        assert!(matches!(
            session.get_card_by_row_id(bad),
            Err(Error::RowCorrupt { .. })
        ));
    }
}
