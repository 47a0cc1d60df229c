//! Per-user session state

use crate::session::render::RenderSurface;
use crate::vault::mode::Capacity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use uuid::Uuid;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Closed,
    Loading,
    Open,
    Navigating,
    Closing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Loading => "loading",
            Self::Open => "open",
            Self::Navigating => "navigating",
            Self::Closing => "closing",
        }
    }

    /// Whether a render surface may be attached
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked viewing session
pub struct Session {
    pub user: Uuid,
    pub state: SessionState,

    /// Page shown (or requested, while loading)
    pub page: u32,

    /// Limits resolved at open
    pub capacity: Capacity,

    /// Set while navigation or a snapshot write owns the session
    pub in_transition: bool,

    /// The user disconnected while the session was loading
    pub departed: bool,

    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub(crate) surface: Option<Box<dyn RenderSurface>>,

    /// Resolves when the initial load finishes
    pub(crate) ready: watch::Receiver<bool>,
}

impl Session {
    /// Create a session in the loading state
    pub(crate) fn loading(user: Uuid, page: u32, ready: watch::Receiver<bool>) -> Self {
        let now = Utc::now();
        Self {
            user,
            state: SessionState::Loading,
            page,
            capacity: Capacity {
                unlocked_slots: 0,
                max_pages: 1,
            },
            in_transition: false,
            departed: false,
            opened_at: now,
            updated_at: now,
            surface: None,
            ready,
        }
    }

    /// Move to `state` and stamp the update time
    pub(crate) fn transition(&mut self, state: SessionState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub fn has_surface(&self) -> bool {
        self.surface.is_some()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("state", &self.state)
            .field("page", &self.page)
            .field("capacity", &self.capacity)
            .field("in_transition", &self.in_transition)
            .field("departed", &self.departed)
            .field("has_surface", &self.surface.is_some())
            .finish_non_exhaustive()
    }
}
