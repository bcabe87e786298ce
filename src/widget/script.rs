//! Single-flight loading of the verification script
//!
//! The load is a small state machine shared by every render:
//!
//! ```text
//! NotStarted --load()--> Loading --ready / grace timer--> Loaded
//!     ^                     |
//!     +------ failed -------+
//! ```
//!
//! Each injection gets an attempt number. Events from a superseded attempt
//! (a ready callback arriving after the attempt already failed) are ignored.

use std::{
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::{runtime::Handle, sync::oneshot, task::AbortHandle, time::sleep};

use crate::core::{
    metrics::{FORCED_READY, SCRIPT_INJECTIONS},
    CoordError, CoordResult, ScriptHost,
};

type Waiter = oneshot::Sender<CoordResult<()>>;

/// Observable script load state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptLoadState {
    NotStarted,
    Loading,
    Loaded,
}

enum LoadState {
    NotStarted,
    Loading {
        attempt: u64,
        waiters: Vec<Waiter>,
        grace: Option<AbortHandle>,
    },
    Loaded,
}

struct LoaderShared {
    state: Mutex<LoadState>,
    attempts: AtomicU64,
}

impl LoaderShared {
    fn lock_state(&self) -> MutexGuard<'_, LoadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `attempt` to `Loaded` and release its waiters. Returns false when
    /// the attempt is no longer the one loading.
    fn complete(&self, attempt: u64) -> bool {
        let waiters = {
            let mut state = self.lock_state();
            match &mut *state {
                LoadState::Loading {
                    attempt: current,
                    waiters,
                    grace,
                } if *current == attempt => {
                    if let Some(timer) = grace.take() {
                        timer.abort();
                    }
                    let waiters = mem::take(waiters);
                    *state = LoadState::Loaded;
                    waiters
                }
                _ => return false,
            }
        };

        info!(
            "Verification script ready (attempt {attempt}), releasing {} waiters",
            waiters.len()
        );
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        true
    }

    /// Revert `attempt` to `NotStarted` and reject its waiters
    fn fail(&self, attempt: u64, reason: String) -> bool {
        let waiters = {
            let mut state = self.lock_state();
            match &mut *state {
                LoadState::Loading {
                    attempt: current,
                    waiters,
                    grace,
                } if *current == attempt => {
                    if let Some(timer) = grace.take() {
                        timer.abort();
                    }
                    let waiters = mem::take(waiters);
                    *state = LoadState::NotStarted;
                    waiters
                }
                _ => return false,
            }
        };

        error!(
            "Verification script failed to load (attempt {attempt}): {reason}, rejecting {} waiters",
            waiters.len()
        );
        let err = CoordError::ScriptLoad(reason);
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
        true
    }
}

/// Handle through which a [`ScriptHost`] reports the progress of one
/// injection attempt.
#[derive(Clone)]
pub struct ScriptEvents {
    shared: Arc<LoaderShared>,
    attempt: u64,
    grace: Duration,
    runtime: Handle,
}

impl ScriptEvents {
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// The resource's native load event fired.
    ///
    /// The script does not always invoke its ready callback afterwards, so a
    /// grace timer is armed that forces the ready signal if it stays silent.
    pub fn loaded(&self) {
        let mut state = self.shared.lock_state();
        let LoadState::Loading { attempt, grace, .. } = &mut *state else {
            return;
        };
        if *attempt != self.attempt || grace.is_some() {
            return;
        }

        debug!(
            "Script resource loaded (attempt {}), waiting up to {}ms for ready signal",
            self.attempt,
            self.grace.as_millis()
        );
        let events = self.clone();
        let timer = self.runtime.spawn(async move {
            sleep(events.grace).await;
            events.force_ready();
        });
        *grace = Some(timer.abort_handle());
    }

    /// The script invoked its ready callback
    pub fn ready(&self) {
        if !self.shared.complete(self.attempt) {
            debug!("Ignoring ready signal for settled attempt {}", self.attempt);
        }
    }

    /// The resource failed to load
    pub fn failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.shared.fail(self.attempt, reason.clone()) {
            warn!(
                "Ignoring load failure for settled attempt {}: {reason}",
                self.attempt
            );
        }
    }

    fn force_ready(&self) {
        // Only counts when this attempt was still loading
        if self.shared.complete(self.attempt) {
            warn!(
                "Ready signal did not fire within {}ms of script load, forced it (attempt {})",
                self.grace.as_millis(),
                self.attempt
            );
            FORCED_READY.inc();
        }
    }
}

/// Owns the single load process of the verification script
pub struct ScriptLoader {
    shared: Arc<LoaderShared>,
    host: Arc<dyn ScriptHost>,
    url: String,
    ready_callback: String,
    grace: Duration,
}

impl ScriptLoader {
    pub fn new(
        host: Arc<dyn ScriptHost>,
        url: impl Into<String>,
        ready_callback: impl Into<String>,
        grace: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(LoaderShared {
                state: Mutex::new(LoadState::NotStarted),
                attempts: AtomicU64::new(0),
            }),
            host,
            url: url.into(),
            ready_callback: ready_callback.into(),
            grace,
        }
    }

    pub fn state(&self) -> ScriptLoadState {
        match &*self.shared.lock_state() {
            LoadState::NotStarted => ScriptLoadState::NotStarted,
            LoadState::Loading { .. } => ScriptLoadState::Loading,
            LoadState::Loaded => ScriptLoadState::Loaded,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == ScriptLoadState::Loaded
    }

    /// Resolve once the script is ready, starting the load if nobody has.
    pub async fn load(&self) -> CoordResult<()> {
        let (receiver, attempt) = {
            let mut state = self.shared.lock_state();
            let (sender, receiver) = oneshot::channel();
            match &mut *state {
                LoadState::Loaded => return Ok(()),
                LoadState::Loading { attempt, waiters, .. } => {
                    debug!("Script load in progress (attempt {attempt}), waiting");
                    waiters.push(sender);
                    (receiver, None)
                }
                LoadState::NotStarted => {
                    if self.host.api_available() {
                        info!("Verification API already present, skipping injection");
                        *state = LoadState::Loaded;
                        return Ok(());
                    }
                    let attempt = self.shared.attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    *state = LoadState::Loading {
                        attempt,
                        waiters: vec![sender],
                        grace: None,
                    };
                    (receiver, Some(attempt))
                }
            }
        };

        if let Some(attempt) = attempt {
            self.inject(attempt);
        }

        receiver.await.unwrap_or_else(|_| {
            Err(CoordError::Abandoned(
                "script load waiter was dropped".to_string(),
            ))
        })
    }

    fn inject(&self, attempt: u64) {
        info!(
            "Injecting verification script {} (attempt {attempt})",
            self.url
        );
        SCRIPT_INJECTIONS.inc();

        let events = ScriptEvents {
            shared: Arc::clone(&self.shared),
            attempt,
            grace: self.grace,
            runtime: Handle::current(),
        };
        if let Err(err) = self
            .host
            .inject_script(&self.url, &self.ready_callback, events)
        {
            let reason = match err {
                CoordError::ScriptLoad(reason) => reason,
                other => other.to_string(),
            };
            self.shared.fail(attempt, reason);
        }
    }
}
