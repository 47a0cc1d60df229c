//! Session coordination
//!
//! Sequences load, render hand-off, navigation and save-on-close for each
//! user. At most one session per user is tracked; a second open is
//! coalesced into the existing one.
//!
//! The session table lock is never held across an `.await` or a call into
//! the renderer, so surfaces may call back into the coordinator (for example
//! [`SessionCoordinator::request_close`]) without deadlocking.

use crate::cache::RecordCache;
use crate::error::{VaultError, VaultResult};
use crate::session::render::{
    CapacityProvider, DefaultCapacity, NavigationRequest, Navigator, PageView, RenderSurface,
    Renderer,
};
use crate::session::state::{Session, SessionState};
use crate::storage::{FlushOutcome, Persister};
use crate::vault::mode::Capacity;
use crate::vault::{ItemBlob, VaultMode, VaultRecord};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often a disconnect retries a close suppressed by navigation
const DISCONNECT_RETRIES: u32 = 50;
const DISCONNECT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Admin slot overrides: 0 clears, otherwise 9..=54
const CUSTOM_SLOTS_RANGE: std::ops::RangeInclusive<u32> = 9..=54;

/// Admin page overrides: 0 clears, otherwise 1..=5
const CUSTOM_PAGES_RANGE: std::ops::RangeInclusive<u32> = 1..=5;

/// Result of a close request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Navigation owns the session; nothing was done
    Suppressed,
    /// No open session for the user
    NotOpen,
    /// Session closed; the record is dirty and waits for a save
    Pending,
    /// Session closed and nothing needed saving
    Clean,
    /// Session closed and the record was saved
    Saved,
    /// Session closed but the save failed; the record stays dirty
    SaveFailed,
}

impl CloseOutcome {
    fn from_flush(outcome: FlushOutcome) -> Self {
        match outcome {
            FlushOutcome::Saved => Self::Saved,
            FlushOutcome::Failed => Self::SaveFailed,
            FlushOutcome::Clean | FlushOutcome::Missing => Self::Clean,
        }
    }
}

/// What an open request found in the session table
enum Tracked {
    Fresh(watch::Sender<bool>),
    Open { page: u32, capacity: Capacity },
    Loading(watch::Receiver<bool>),
    Busy(SessionState),
}

/// Coordinates vault sessions for all users
pub struct SessionCoordinator {
    cache: Arc<RecordCache>,
    persister: Arc<Persister>,
    mode: VaultMode,
    renderer: Arc<dyn Renderer>,
    capacity: Arc<dyn CapacityProvider>,
    sessions: Mutex<HashMap<Uuid, Session>>,
    /// Users present on the server, each with the number of the arrival
    /// that brought them online
    online: Mutex<HashMap<Uuid, u64>>,
    arrivals: AtomicU64,
    nav_tx: mpsc::UnboundedSender<NavigationRequest>,
    nav_rx: Mutex<Option<mpsc::UnboundedReceiver<NavigationRequest>>>,
}

impl SessionCoordinator {
    /// Create a new coordinator
    pub fn new(persister: Arc<Persister>, mode: VaultMode, renderer: Arc<dyn Renderer>) -> Self {
        let (nav_tx, nav_rx) = mpsc::unbounded_channel();
        Self {
            cache: Arc::clone(persister.cache()),
            persister,
            mode,
            renderer,
            capacity: Arc::new(DefaultCapacity),
            sessions: Mutex::new(HashMap::new()),
            online: Mutex::new(HashMap::new()),
            arrivals: AtomicU64::new(0),
            nav_tx,
            nav_rx: Mutex::new(Some(nav_rx)),
        }
    }

    /// Use a capacity provider other than [`DefaultCapacity`]
    pub fn with_capacity(mut self, capacity: Arc<dyn CapacityProvider>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Take the receiving end of the navigation channel. Only the first call
    /// gets it.
    pub fn take_navigation_requests(&self) -> Option<mpsc::UnboundedReceiver<NavigationRequest>> {
        self.nav_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn mode(&self) -> &VaultMode {
        &self.mode
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    pub fn persister(&self) -> &Arc<Persister> {
        &self.persister
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(&self) -> MutexGuard<'_, HashMap<Uuid, u64>> {
        self.online.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the user online and return their arrival number. A user who is
    /// already online keeps the number they arrived with.
    fn arrive(&self, user: Uuid) -> u64 {
        *self
            .online()
            .entry(user)
            .or_insert_with(|| self.arrivals.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn still_arrived(&self, user: Uuid, arrival: u64) -> bool {
        self.online().get(&user) == Some(&arrival)
    }

    fn navigator(&self, user: Uuid, page: u32, max_pages: u32) -> Navigator {
        Navigator::new(user, page, max_pages, self.nav_tx.clone())
    }

    fn view_for(&self, user: Uuid, page: u32, capacity: Capacity) -> Option<PageView> {
        let record = self.cache.get(user)?;
        Some(PageView {
            user,
            page,
            slots: record
                .page_or_empty(page, self.mode.page_width())
                .slots()
                .to_vec(),
            unlocked: capacity.unlocked_slots,
            max_pages: capacity.max_pages,
        })
    }

    /// Write a surface's live contents into the cached record, then detach it
    fn store_and_detach(
        &self,
        user: Uuid,
        page: u32,
        capacity: Capacity,
        surface: Box<dyn RenderSurface>,
    ) -> Option<bool> {
        let snapshot = surface.snapshot();
        let width = self.mode.page_width();
        let written = self.cache.update(user, |record| {
            record.write_slots(page, width, &snapshot, capacity.unlocked_slots)
        });
        surface.detach();
        written
    }

    /// Drop the cache entry of a user who left, unless it still needs saving
    fn release_departed(&self, user: Uuid) {
        if self.cache.is_dirty(user) {
            self.cache.retire(user);
            warn!(
                "Keeping unsaved vault for departed user {} until a save succeeds",
                user
            );
        } else {
            self.cache.remove(user);
        }
    }

    fn abandon_loading(&self, user: Uuid) {
        let mut sessions = self.sessions();
        if sessions
            .get(&user)
            .is_some_and(|s| s.state == SessionState::Loading)
        {
            sessions.remove(&user);
        }
    }

    /// Remove a loading session whose opener went away without finishing
    fn drop_orphaned_loading(&self, user: Uuid, ready: &watch::Receiver<bool>) {
        let mut sessions = self.sessions();
        if sessions.get(&user).is_some_and(|s| {
            s.state == SessionState::Loading && s.ready.same_channel(ready)
        }) {
            sessions.remove(&user);
        }
    }

    /// Open `page` of the user's vault and present it
    pub async fn open_session(&self, user: Uuid, page: u32) -> VaultResult<PageView> {
        if user.is_nil() {
            return Err(VaultError::InvalidArgument(
                "user id must not be nil".to_string(),
            ));
        }
        let started = Instant::now();

        let ready = loop {
            let tracked = {
                let mut sessions = self.sessions();
                match sessions.get(&user) {
                    Some(session) => match session.state {
                        SessionState::Open => Tracked::Open {
                            page: session.page,
                            capacity: session.capacity,
                        },
                        SessionState::Loading => Tracked::Loading(session.ready.clone()),
                        state => Tracked::Busy(state),
                    },
                    None => {
                        let (tx, rx) = watch::channel(false);
                        sessions.insert(user, Session::loading(user, page, rx));
                        Tracked::Fresh(tx)
                    }
                }
            };

            match tracked {
                Tracked::Fresh(ready) => break ready,
                Tracked::Open { page, capacity } => {
                    warn!("Second open for {} coalesced into the open session", user);
                    return self
                        .view_for(user, page, capacity)
                        .ok_or(VaultError::SessionNotOpen(user));
                }
                Tracked::Loading(mut loaded) => {
                    warn!("Second open for {} coalesced into the loading session", user);
                    if loaded.wait_for(|done| *done).await.is_err() {
                        self.drop_orphaned_loading(user, &loaded);
                    }
                    if let Some(view) = self.current_page_view(user) {
                        return Ok(view);
                    }
                    if !self.online().contains_key(&user) {
                        return Err(VaultError::UserUnavailable(user));
                    }
                    // The earlier open failed on its own terms; try ours
                    debug!("Earlier open for {} did not finish; retrying", user);
                }
                Tracked::Busy(state) => {
                    return Err(VaultError::InvalidTransition {
                        user,
                        state: state.to_string(),
                        action: "open",
                    });
                }
            }
        };

        self.arrive(user);
        let result = self.finish_open(user, page).await;
        match &result {
            Ok(view) => {
                let _ = ready.send(true);
                self.persister.metrics().record_since("open", started);
                info!(page = view.page, "Opened vault for {}", user);
            }
            Err(e) => {
                self.abandon_loading(user);
                debug!("Open for {} abandoned: {}", user, e);
            }
        }
        result
    }

    async fn finish_open(&self, user: Uuid, page: u32) -> VaultResult<PageView> {
        self.cache.reinstate(user);
        if !self.cache.contains(user) {
            let started = Instant::now();
            let record = self.persister.backend().load(user).await;
            self.persister.metrics().record_since("load", started);
            self.cache.put_if_absent(user, record)?;
        }

        let departed = self.sessions().get(&user).map_or(true, |s| s.departed);
        if departed {
            self.release_departed(user);
            return Err(VaultError::UserUnavailable(user));
        }

        let record = self
            .cache
            .get(user)
            .ok_or_else(|| VaultError::Internal(format!("vault for {} left the cache", user)))?;
        let capacity = self.resolve_capacity(user, &record);
        if page < 1 || page > capacity.max_pages {
            return Err(VaultError::PageOutOfRange {
                page,
                max: capacity.max_pages,
            });
        }

        let view = self
            .view_for(user, page, capacity)
            .ok_or_else(|| VaultError::Internal(format!("vault for {} left the cache", user)))?;
        let surface = self
            .renderer
            .present(&view, self.navigator(user, page, capacity.max_pages))?;

        let rejected = {
            let mut sessions = self.sessions();
            match sessions.get_mut(&user) {
                Some(session) if !session.departed => {
                    session.page = page;
                    session.capacity = capacity;
                    session.surface = Some(surface);
                    session.transition(SessionState::Open);
                    None
                }
                _ => Some(surface),
            }
        };

        if let Some(surface) = rejected {
            surface.detach();
            self.release_departed(user);
            return Err(VaultError::UserUnavailable(user));
        }
        Ok(view)
    }

    fn resolve_capacity(&self, user: Uuid, record: &VaultRecord) -> Capacity {
        self.mode.capacity(
            record,
            self.capacity.slot_grant(user),
            self.capacity.page_grant(user),
        )
    }

    /// Move an open session to another page
    ///
    /// The live contents of the current page are written to the cache before
    /// the new page is presented. If any step fails the session is dropped.
    pub fn navigate(&self, user: Uuid, target: u32) -> VaultResult<PageView> {
        let started = Instant::now();

        let (from, capacity, surface) = {
            let mut sessions = self.sessions();
            let session = sessions
                .get_mut(&user)
                .ok_or(VaultError::SessionNotOpen(user))?;
            if session.state != SessionState::Open || session.in_transition {
                return Err(VaultError::InvalidTransition {
                    user,
                    state: session.state.to_string(),
                    action: "navigate",
                });
            }
            if target < 1 || target > session.capacity.max_pages {
                return Err(VaultError::PageOutOfRange {
                    page: target,
                    max: session.capacity.max_pages,
                });
            }
            session.transition(SessionState::Navigating);
            session.in_transition = true;
            (session.page, session.capacity, session.surface.take())
        };

        let result = self.swap_page(user, from, target, capacity, surface);

        let mut sessions = self.sessions();
        match result {
            Ok((view, surface)) => {
                let orphan = match sessions.get_mut(&user) {
                    Some(session) => {
                        session.page = target;
                        session.surface = Some(surface);
                        session.in_transition = false;
                        session.transition(SessionState::Open);
                        None
                    }
                    None => Some(surface),
                };
                drop(sessions);

                if let Some(surface) = orphan {
                    surface.detach();
                    return Err(VaultError::SessionNotOpen(user));
                }
                self.persister.metrics().record_since("navigate", started);
                debug!(from, to = target, "Navigated vault for {}", user);
                Ok(view)
            }
            Err(e) => {
                sessions.remove(&user);
                drop(sessions);
                error!(
                    from,
                    to = target,
                    "Navigation for {} failed, session closed: {}",
                    user,
                    e
                );
                Err(e)
            }
        }
    }

    fn swap_page(
        &self,
        user: Uuid,
        from: u32,
        target: u32,
        capacity: Capacity,
        surface: Option<Box<dyn RenderSurface>>,
    ) -> VaultResult<(PageView, Box<dyn RenderSurface>)> {
        if let Some(surface) = surface {
            if self.store_and_detach(user, from, capacity, surface).is_none() {
                return Err(VaultError::Internal(format!(
                    "vault for {} left the cache mid-navigation",
                    user
                )));
            }
        }

        let view = self.view_for(user, target, capacity).ok_or_else(|| {
            VaultError::Internal(format!("vault for {} left the cache mid-navigation", user))
        })?;
        let surface = self
            .renderer
            .present(&view, self.navigator(user, target, capacity.max_pages))?;
        Ok((view, surface))
    }

    /// Synchronous first phase of a close
    ///
    /// Writes the live surface into the cache, detaches it and drops the
    /// session. The save is left to the caller or the auto-saver. Returns
    /// `Suppressed` while navigation owns the session.
    pub fn request_close(&self, user: Uuid) -> CloseOutcome {
        let (page, capacity, surface) = {
            let mut sessions = self.sessions();
            let Some(session) = sessions.get_mut(&user) else {
                return CloseOutcome::NotOpen;
            };
            if session.in_transition {
                debug!("Close for {} suppressed; session is in transition", user);
                return CloseOutcome::Suppressed;
            }
            if session.state != SessionState::Open {
                return CloseOutcome::NotOpen;
            }
            session.transition(SessionState::Closing);
            (session.page, session.capacity, session.surface.take())
        };

        if let Some(surface) = surface {
            if self.store_and_detach(user, page, capacity, surface).is_none() {
                warn!("Closed vault for {} had no cached record", user);
            }
        }
        self.sessions().remove(&user);

        if self.cache.is_dirty(user) {
            CloseOutcome::Pending
        } else {
            CloseOutcome::Clean
        }
    }

    /// Close the session and save the record if it changed
    pub async fn close_session(&self, user: Uuid) -> CloseOutcome {
        let started = Instant::now();
        let outcome = match self.request_close(user) {
            CloseOutcome::Pending => {
                CloseOutcome::from_flush(self.persister.persist(user).await)
            }
            other => return other,
        };

        if outcome == CloseOutcome::SaveFailed {
            warn!("Vault for {} stays dirty until the next auto-save", user);
        }
        self.persister.metrics().record_since("close", started);
        debug!(outcome = ?outcome, "Closed vault for {}", user);
        outcome
    }

    /// The page currently shown to the user
    pub fn current_page_view(&self, user: Uuid) -> Option<PageView> {
        let (page, capacity) = {
            let sessions = self.sessions();
            let session = sessions.get(&user)?;
            if !session.state.is_open() {
                return None;
            }
            (session.page, session.capacity)
        };
        self.view_for(user, page, capacity)
    }

    /// Accept the renderer's report of the open page's contents
    ///
    /// Only unlocked slots are written; locked slots keep their stored items.
    pub fn apply_slot_snapshot(
        &self,
        user: Uuid,
        page: u32,
        slots: &[Option<ItemBlob>],
    ) -> VaultResult<()> {
        let (capacity, mut surface) = {
            let mut sessions = self.sessions();
            let session = sessions
                .get_mut(&user)
                .ok_or(VaultError::SessionNotOpen(user))?;
            if session.state != SessionState::Open || session.in_transition {
                return Err(VaultError::InvalidTransition {
                    user,
                    state: session.state.to_string(),
                    action: "apply a slot snapshot",
                });
            }
            if session.page != page {
                return Err(VaultError::InvalidArgument(format!(
                    "page {} is not open for {} (page {} is)",
                    page, user, session.page
                )));
            }
            session.in_transition = true;
            (session.capacity, session.surface.take())
        };

        let width = self.mode.page_width();
        let written = self.cache.update(user, |record| {
            record.write_slots(page, width, slots, capacity.unlocked_slots)
        });

        if let (Some(surface), Some(view)) =
            (surface.as_mut(), self.view_for(user, page, capacity))
        {
            surface.redraw(&view);
        }

        let orphan = {
            let mut sessions = self.sessions();
            match sessions.get_mut(&user) {
                Some(session) => {
                    session.in_transition = false;
                    session.surface = surface;
                    session.transition(SessionState::Open);
                    None
                }
                None => surface,
            }
        };
        if let Some(surface) = orphan {
            surface.detach();
        }

        match written {
            Some(_) => Ok(()),
            None => Err(VaultError::Internal(format!(
                "vault for {} is not cached",
                user
            ))),
        }
    }

    /// Warm the cache when a user arrives
    pub async fn preload(&self, user: Uuid) {
        let arrival = self.arrive(user);
        self.cache.reinstate(user);
        if self.cache.contains(user) {
            return;
        }

        let started = Instant::now();
        let record = self.persister.backend().load(user).await;
        self.persister.metrics().record_since("load", started);

        if !self.still_arrived(user, arrival) {
            debug!("{} left before their vault finished loading", user);
            return;
        }
        match self.cache.put_if_absent(user, record) {
            Ok(true) => debug!("Preloaded vault for {}", user),
            Ok(false) => {}
            Err(e) => warn!("Failed to preload vault for {}: {}", user, e),
        }
    }

    /// Close the user's session, save, and release their cache entry
    ///
    /// A record that could not be saved stays cached and dirty and is
    /// evicted after the next successful save.
    pub async fn disconnect(&self, user: Uuid) -> CloseOutcome {
        self.online().remove(&user);
        {
            let mut sessions = self.sessions();
            if let Some(session) = sessions.get_mut(&user) {
                if session.state == SessionState::Loading {
                    session.departed = true;
                    debug!("{} disconnected while their vault was loading", user);
                    return CloseOutcome::NotOpen;
                }
            }
        }

        let mut outcome = self.close_session(user).await;
        let mut retries = 0;
        while outcome == CloseOutcome::Suppressed && retries < DISCONNECT_RETRIES {
            tokio::time::sleep(DISCONNECT_RETRY_DELAY).await;
            outcome = self.close_session(user).await;
            retries += 1;
        }

        if outcome == CloseOutcome::Suppressed {
            warn!("Session for {} stayed in transition; leaving it open", user);
            return outcome;
        }
        if outcome == CloseOutcome::NotOpen && self.cache.is_dirty(user) {
            outcome = CloseOutcome::from_flush(self.persister.persist(user).await);
        }

        self.release_departed(user);
        info!(outcome = ?outcome, "Released vault for {}", user);
        outcome
    }

    /// Set the admin slot override (0 clears it) and save immediately
    pub async fn set_custom_slots(&self, user: Uuid, slots: u32) -> VaultResult<FlushOutcome> {
        if slots != 0 && !CUSTOM_SLOTS_RANGE.contains(&slots) {
            return Err(VaultError::InvalidArgument(format!(
                "custom slots must be 0 or between {} and {}, got {}",
                CUSTOM_SLOTS_RANGE.start(),
                CUSTOM_SLOTS_RANGE.end(),
                slots
            )));
        }
        self.apply_override(user, move |record| {
            if record.custom_slots() == slots {
                return false;
            }
            record.set_custom_slots(slots);
            true
        })
        .await
    }

    /// Set the admin page override (0 clears it) and save immediately
    pub async fn set_custom_pages(&self, user: Uuid, pages: u32) -> VaultResult<FlushOutcome> {
        if pages != 0 && !CUSTOM_PAGES_RANGE.contains(&pages) {
            return Err(VaultError::InvalidArgument(format!(
                "custom pages must be 0 or between {} and {}, got {}",
                CUSTOM_PAGES_RANGE.start(),
                CUSTOM_PAGES_RANGE.end(),
                pages
            )));
        }
        self.apply_override(user, move |record| {
            if record.custom_pages() == pages {
                return false;
            }
            record.set_custom_pages(pages);
            true
        })
        .await
    }

    async fn apply_override<F>(&self, user: Uuid, f: F) -> VaultResult<FlushOutcome>
    where
        F: FnOnce(&mut VaultRecord) -> bool + Send,
    {
        let was_cached = self.cache.contains(user);
        if !was_cached {
            let record = self.persister.backend().load(user).await;
            self.cache.put_if_absent(user, record)?;
        }

        self.cache
            .update(user, f)
            .ok_or_else(|| VaultError::Internal(format!("vault for {} is not cached", user)))?;
        let outcome = self.persister.persist(user).await;

        if !was_cached && !self.is_active(user) && !self.cache.is_dirty(user) {
            self.cache.remove(user);
        }
        Ok(outcome)
    }

    fn is_active(&self, user: Uuid) -> bool {
        self.sessions().contains_key(&user) || self.online().contains_key(&user)
    }

    /// Close every session; used at shutdown. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let users: Vec<Uuid> = {
            let mut sessions = self.sessions();
            for session in sessions.values_mut() {
                if session.state == SessionState::Loading {
                    session.departed = true;
                }
            }
            sessions.keys().copied().collect()
        };

        let mut closed = 0;
        for user in users {
            match self.close_session(user).await {
                CloseOutcome::Saved | CloseOutcome::Clean | CloseOutcome::SaveFailed => {
                    closed += 1
                }
                CloseOutcome::Suppressed => {
                    warn!("Session for {} in transition during shutdown", user)
                }
                CloseOutcome::NotOpen | CloseOutcome::Pending => {}
            }
        }
        if closed > 0 {
            info!("Closed {} vault session(s)", closed);
        }
        closed
    }

    /// Drop clean cache entries of users who are neither online nor in a session
    pub fn evict_idle(&self) -> usize {
        let mut active: HashSet<Uuid> = self.sessions().keys().copied().collect();
        active.extend(self.online().keys().copied());
        self.cache.evict_inactive(&active)
    }

    /// Users with a tracked session, sorted
    pub fn open_sessions(&self) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self.sessions().keys().copied().collect();
        users.sort();
        users
    }

    pub fn session_state(&self, user: Uuid) -> SessionState {
        self.sessions()
            .get(&user)
            .map_or(SessionState::Closed, |s| s.state)
    }
}
