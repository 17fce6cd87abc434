//! Hybrid timeout + lifecycle session tracking.
//!
//! A session continues while activity keeps arriving within the timeout.
//! Backgrounding the app records the instant but does not end the session
//! (the user may return quickly); foregrounding after more than the
//! timeout ends it proactively so the next activity mints a fresh id.
//!
//! The clock is injected as a millisecond function so tests drive timeout
//! behavior without sleeping; production binds it to a monotonic clock.

use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

pub type ClockFn = Box<dyn Fn() -> u64 + Send + Sync>;
pub type StartCallback = Box<dyn Fn(&str) + Send + Sync>;
/// `(session_id, duration_ms)`.
pub type EndCallback = Box<dyn Fn(&str, u64) + Send + Sync>;

#[derive(Default)]
struct SessionState {
    session_id: String,
    started_at: u64,
    last_activity: u64,
    background_at: Option<u64>,
}

pub struct SessionTracker {
    timeout: Duration,
    enabled: Mutex<bool>,
    // One mutex: every operation writes, so read/write separation would
    // only mislead.
    state: Mutex<Option<SessionState>>,
    clock: ClockFn,
    on_start: Option<StartCallback>,
    on_end: Option<EndCallback>,
}

impl SessionTracker {
    pub fn new(timeout: Duration, enabled: bool) -> Self {
        Self {
            timeout,
            enabled: Mutex::new(enabled),
            state: Mutex::new(None),
            clock: Box::new(monotonic_ms),
            on_start: None,
            on_end: None,
        }
    }

    pub fn with_clock(mut self, clock: ClockFn) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_session_start(mut self, callback: StartCallback) -> Self {
        self.on_start = Some(callback);
        self
    }

    pub fn on_session_end(mut self, callback: EndCallback) -> Self {
        self.on_end = Some(callback);
        self
    }

    /// Record activity and return the session id it belongs to.
    ///
    /// Disabled tracking returns an empty id.  Activity within the timeout
    /// extends the current session; otherwise the old session ends (firing
    /// the end callback with its duration) and a fresh one starts.
    pub fn record_activity(&self) -> String {
        if !self.is_enabled() {
            return String::new();
        }
        let now = (self.clock)();
        let mut state = self.lock_state();

        if let Some(session) = state.as_mut() {
            if now.saturating_sub(session.last_activity) <= self.timeout.as_millis() as u64 {
                session.last_activity = now;
                session.background_at = None;
                return session.session_id.clone();
            }
            let ended = state.take();
            drop(state);
            self.fire_end(ended, now);
            state = self.lock_state();
        }

        let session_id = Uuid::new_v4().to_string();
        *state = Some(SessionState {
            session_id: session_id.clone(),
            started_at: now,
            last_activity: now,
            background_at: None,
        });
        drop(state);
        if let Some(on_start) = &self.on_start {
            on_start(&session_id);
        }
        session_id
    }

    /// Note the background instant.  The session stays open.
    pub fn app_did_enter_background(&self) {
        let now = (self.clock)();
        if let Some(session) = self.lock_state().as_mut() {
            session.background_at = Some(now);
        }
    }

    /// End the session if the app stayed backgrounded past the timeout.
    pub fn app_will_enter_foreground(&self) {
        let now = (self.clock)();
        let mut state = self.lock_state();
        let expired = state
            .as_ref()
            .and_then(|s| s.background_at)
            .is_some_and(|bg| now.saturating_sub(bg) > self.timeout.as_millis() as u64);
        if expired {
            let ended = state.take();
            drop(state);
            self.fire_end(ended, now);
        }
    }

    /// Disabling ends any current session immediately; re-enabling starts
    /// from a clean slate.
    pub fn set_enabled(&self, enabled: bool) {
        *self
            .enabled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = enabled;
        let ended = self.lock_state().take();
        if !enabled {
            self.fire_end(ended, (self.clock)());
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self
            .enabled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// End any current session and forget state (reset flows).
    pub fn reset(&self) {
        let ended = self.lock_state().take();
        self.fire_end(ended, (self.clock)());
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.lock_state().as_ref().map(|s| s.session_id.clone())
    }

    fn fire_end(&self, ended: Option<SessionState>, now: u64) {
        if let (Some(session), Some(on_end)) = (ended, &self.on_end) {
            let duration = now.saturating_sub(session.started_at);
            on_end(&session.session_id, duration);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Option<SessionState>> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Milliseconds from a process-local monotonic origin.
fn monotonic_ms() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_millis() as u64
}
