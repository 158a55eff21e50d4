//! Reference-counted sessions.
//!
//! A session is the live backend handle behind one key: a browse for one
//! service type, or the publisher shared by all registrations. The
//! [`SessionManager`] creates a session on the first acquire and tears it
//! down synchronously on the last release. A session that reports itself
//! failed is evicted on the next acquire, which starts a fresh one. Only
//! creation and destruction are serialized; events flow without touching the
//! manager's lock.

use beacon_core::{BeaconError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a session does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Discovery,
    Registration,
}

/// Identifies a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub kind: SessionKind,
    pub key: String,
}

impl SessionKey {
    /// Key for browsing a normalized service type.
    pub fn discovery(service_type: impl Into<String>) -> Self {
        Self {
            kind: SessionKind::Discovery,
            key: service_type.into(),
        }
    }

    pub fn registration(key: impl Into<String>) -> Self {
        Self {
            kind: SessionKind::Registration,
            key: key.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SessionKind::Discovery => write!(f, "discovery:{}", self.key),
            SessionKind::Registration => write!(f, "registration:{}", self.key),
        }
    }
}

/// A backend handle with an explicit lifecycle.
pub trait ManagedSession: Send + Sync + 'static {
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Whether the session can no longer deliver anything. A failed session
    /// is replaced instead of shared.
    fn is_failed(&self) -> bool {
        false
    }
}

/// Builds sessions on demand.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: ManagedSession;

    fn create(&self, key: &SessionKey) -> Result<Self::Session>;
}

struct Slot<S> {
    session: Arc<S>,
    refs: usize,
    generation: u64,
}

pub struct SessionManager<F: SessionFactory> {
    factory: F,
    slots: Mutex<HashMap<SessionKey, Slot<F::Session>>>,
    generations: AtomicU64,
}

impl<F: SessionFactory> SessionManager<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Returns the live session for `key`, creating and starting it if needed.
    pub fn acquire(&self, key: &SessionKey) -> Result<Arc<F::Session>> {
        self.acquire_with(key, |_| ()).map(|(session, ())| session)
    }

    /// Like [`acquire`](Self::acquire), but runs `attach` on the session
    /// before it is started when it is fresh. Whatever `attach` subscribes to
    /// is therefore in place before the backend can emit anything.
    ///
    /// A session whose `start` fails is not kept; the next acquire retries.
    pub fn acquire_with<T>(
        &self,
        key: &SessionKey,
        attach: impl FnOnce(&F::Session) -> T,
    ) -> Result<(Arc<F::Session>, T)> {
        self.acquire_slot(key, attach)
            .map(|(session, _, attached)| (session, attached))
    }

    /// Acquires through [`acquire_with`](Self::acquire_with) and returns a
    /// guard that releases this generation of the session on drop.
    pub(crate) fn acquire_guarded<T>(
        self: &Arc<Self>,
        key: &SessionKey,
        attach: impl FnOnce(&F::Session) -> T,
    ) -> Result<(SessionGuard, T)> {
        let (_, generation, attached) = self.acquire_slot(key, attach)?;
        let guard = SessionGuard::new(key.clone(), generation, self.clone());
        Ok((guard, attached))
    }

    fn acquire_slot<T>(
        &self,
        key: &SessionKey,
        attach: impl FnOnce(&F::Session) -> T,
    ) -> Result<(Arc<F::Session>, u64, T)> {
        let mut slots = self.slots.lock();

        let failed = match slots.get_mut(key) {
            Some(slot) if !slot.session.is_failed() => {
                slot.refs += 1;
                debug!(session = %key, refs = slot.refs, generation = slot.generation, "Attached to live session");
                let attached = attach(&*slot.session);
                return Ok((slot.session.clone(), slot.generation, attached));
            }
            Some(_) => true,
            None => false,
        };
        let evicted = if failed { slots.remove(key) } else { None };
        if let Some(slot) = &evicted {
            match slot.session.stop() {
                Ok(()) => info!(session = %key, generation = slot.generation, refs = slot.refs, "Evicted failed session"),
                Err(e) => warn!(session = %key, generation = slot.generation, error = %e, "Failed session stop failed"),
            }
        }

        let result = self.start_slot(&mut slots, key, attach);

        drop(slots);
        drop(evicted);
        result
    }

    fn start_slot<T>(
        &self,
        slots: &mut HashMap<SessionKey, Slot<F::Session>>,
        key: &SessionKey,
        attach: impl FnOnce(&F::Session) -> T,
    ) -> Result<(Arc<F::Session>, u64, T)> {
        let session = Arc::new(self.factory.create(key)?);
        let attached = attach(&*session);
        if let Err(e) = session.start() {
            warn!(session = %key, error = %e, "Session failed to start");
            return Err(e);
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        info!(session = %key, generation, "Session started");
        slots.insert(
            key.clone(),
            Slot {
                session: session.clone(),
                refs: 1,
                generation,
            },
        );

        Ok((session, generation, attached))
    }

    /// Drops one reference. The last release stops the session before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::SessionUnderflow`] if `key` has no live session.
    /// Stop failures are logged, not returned: the session is gone either way.
    pub fn release(&self, key: &SessionKey) -> Result<()> {
        self.release_slot(key, None)
    }

    /// Releases one reference to `generation` of the session. A no-op when
    /// that generation was already evicted and replaced.
    pub(crate) fn release_generation(&self, key: &SessionKey, generation: u64) -> Result<()> {
        self.release_slot(key, Some(generation))
    }

    fn release_slot(&self, key: &SessionKey, generation: Option<u64>) -> Result<()> {
        let mut slots = self.slots.lock();

        let Some(slot) = slots.get_mut(key) else {
            if generation.is_some() {
                debug!(session = %key, ?generation, "Released an evicted session");
                return Ok(());
            }
            warn!(session = %key, "Release without a live session");
            return Err(BeaconError::SessionUnderflow {
                key: key.to_string(),
            });
        };
        if generation.is_some_and(|g| g != slot.generation) {
            debug!(session = %key, ?generation, live = slot.generation, "Released an evicted session");
            return Ok(());
        }

        slot.refs -= 1;
        if slot.refs > 0 {
            debug!(session = %key, refs = slot.refs, "Detached from session");
            return Ok(());
        }

        let Some(slot) = slots.remove(key) else {
            return Ok(());
        };
        match slot.session.stop() {
            Ok(()) => info!(session = %key, generation = slot.generation, "Session torn down"),
            Err(e) => warn!(session = %key, generation = slot.generation, error = %e, "Session stop failed"),
        }

        // The session may own callbacks that re-enter the manager when dropped.
        drop(slots);
        drop(slot);
        Ok(())
    }

    /// Number of live references to `key`.
    pub fn ref_count(&self, key: &SessionKey) -> usize {
        self.slots.lock().get(key).map_or(0, |slot| slot.refs)
    }

    /// Generation of the live session for `key`. Every fresh session gets a
    /// new, larger number.
    pub fn generation(&self, key: &SessionKey) -> Option<u64> {
        self.slots.lock().get(key).map(|slot| slot.generation)
    }

    pub fn is_live(&self, key: &SessionKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Type-erased release, so a guard does not carry the factory type.
pub(crate) trait SessionRelease: Send + Sync {
    fn release_key(&self, key: &SessionKey, generation: u64);
}

impl<F: SessionFactory> SessionRelease for SessionManager<F> {
    fn release_key(&self, key: &SessionKey, generation: u64) {
        if let Err(e) = self.release_generation(key, generation) {
            warn!(session = %key, error = %e, "Session guard release failed");
        }
    }
}

/// Holds one reference to a session and releases it on drop.
pub(crate) struct SessionGuard {
    key: SessionKey,
    generation: u64,
    manager: Arc<dyn SessionRelease>,
}

impl SessionGuard {
    fn new(key: SessionKey, generation: u64, manager: Arc<dyn SessionRelease>) -> Self {
        Self {
            key,
            generation,
            manager,
        }
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.release_key(&self.key, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct Counts {
        created: AtomicUsize,
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct CountingSession {
        counts: Arc<Counts>,
        fail_start: bool,
        failed: AtomicBool,
    }

    impl ManagedSession for CountingSession {
        fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(BeaconError::start_failed("_http._tcp", 9));
            }
            self.counts.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.counts.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_failed(&self) -> bool {
            self.failed.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        counts: Arc<Counts>,
        fail_start: AtomicBool,
    }

    impl SessionFactory for CountingFactory {
        type Session = CountingSession;

        fn create(&self, _key: &SessionKey) -> Result<CountingSession> {
            self.counts.created.fetch_add(1, Ordering::SeqCst);
            Ok(CountingSession {
                counts: self.counts.clone(),
                fail_start: self.fail_start.load(Ordering::SeqCst),
                failed: AtomicBool::new(false),
            })
        }
    }

    fn key() -> SessionKey {
        SessionKey::discovery("_http._tcp")
    }

    #[test]
    fn test_shared_session_and_single_teardown() {
        let manager = SessionManager::new(CountingFactory::default());
        let counts = manager.factory().counts.clone();

        let first = manager.acquire(&key()).unwrap();
        let second = manager.acquire(&key()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.ref_count(&key()), 2);
        assert_eq!(counts.started.load(Ordering::SeqCst), 1);

        manager.release(&key()).unwrap();
        assert_eq!(counts.stopped.load(Ordering::SeqCst), 0);
        manager.release(&key()).unwrap();
        assert_eq!(counts.stopped.load(Ordering::SeqCst), 1);
        assert!(!manager.is_live(&key()));
    }

    #[test]
    fn test_release_without_session_underflows() {
        let manager = SessionManager::new(CountingFactory::default());
        let err = manager.release(&key()).unwrap_err();
        assert!(matches!(err, BeaconError::SessionUnderflow { .. }));

        manager.acquire(&key()).unwrap();
        manager.release(&key()).unwrap();
        assert!(manager.release(&key()).is_err());
        assert_eq!(manager.ref_count(&key()), 0);
    }

    #[test]
    fn test_reacquire_creates_fresh_generation() {
        let manager = SessionManager::new(CountingFactory::default());

        manager.acquire(&key()).unwrap();
        let first = manager.generation(&key()).unwrap();
        manager.release(&key()).unwrap();

        manager.acquire(&key()).unwrap();
        let second = manager.generation(&key()).unwrap();
        assert!(second > first);
        assert_eq!(manager.factory().counts.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_start_is_not_kept() {
        let manager = SessionManager::new(CountingFactory::default());
        manager.factory().fail_start.store(true, Ordering::SeqCst);

        assert!(manager.acquire(&key()).is_err());
        assert!(manager.is_empty());

        manager.factory().fail_start.store(false, Ordering::SeqCst);
        assert!(manager.acquire(&key()).is_ok());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_attach_runs_before_start_only_once_per_acquire() {
        let manager = SessionManager::new(CountingFactory::default());
        let counts = manager.factory().counts.clone();

        let (_, started_at_attach) = manager
            .acquire_with(&key(), |_| counts.started.load(Ordering::SeqCst))
            .unwrap();
        assert_eq!(started_at_attach, 0);

        let (_, started_at_attach) = manager
            .acquire_with(&key(), |_| counts.started.load(Ordering::SeqCst))
            .unwrap();
        assert_eq!(started_at_attach, 1);
    }

    #[test]
    fn test_failed_session_is_replaced_on_next_acquire() {
        let manager = Arc::new(SessionManager::new(CountingFactory::default()));
        let counts = manager.factory().counts.clone();

        let (old_guard, ()) = manager.acquire_guarded(&key(), |_| ()).unwrap();
        let old_generation = manager.generation(&key()).unwrap();
        let old = manager.acquire(&key()).unwrap();
        manager.release(&key()).unwrap();
        old.failed.store(true, Ordering::SeqCst);

        let (new_guard, ()) = manager.acquire_guarded(&key(), |_| ()).unwrap();
        let new_generation = manager.generation(&key()).unwrap();
        assert!(new_generation > old_generation);
        assert_eq!(counts.created.load(Ordering::SeqCst), 2);
        assert_eq!(counts.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(manager.ref_count(&key()), 1);

        // Releasing the evicted generation leaves the fresh session alone
        drop(old_guard);
        assert!(manager.is_live(&key()));
        assert_eq!(manager.ref_count(&key()), 1);

        drop(new_guard);
        assert!(!manager.is_live(&key()));
        assert_eq!(counts.stopped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_interleaved_guards_tear_down_once() {
        let manager = Arc::new(SessionManager::new(CountingFactory::default()));
        let counts = manager.factory().counts.clone();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let (guard, ()) = manager.acquire_guarded(&key(), |_| ()).unwrap();
                        drop(guard);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(!manager.is_live(&key()));
        assert_eq!(
            counts.started.load(Ordering::SeqCst),
            counts.stopped.load(Ordering::SeqCst)
        );
    }
}
