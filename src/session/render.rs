//! Seams between the coordinator and its collaborators
//!
//! The coordinator owns every render surface it attaches. Surfaces never
//! hold a reference back to the coordinator; they ask for page changes
//! through a [`Navigator`], which only enqueues a [`NavigationRequest`] for
//! the host to drain.

use crate::error::VaultResult;
use crate::vault::ItemBlob;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Everything a renderer needs to draw one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageView {
    pub user: Uuid,
    pub page: u32,
    /// Full page width; slots at or past `unlocked` are locked
    pub slots: Vec<Option<ItemBlob>>,
    pub unlocked: usize,
    pub max_pages: u32,
}

impl PageView {
    pub fn is_locked(&self, slot: usize) -> bool {
        slot >= self.unlocked
    }

    pub fn has_next(&self) -> bool {
        self.page < self.max_pages
    }

    pub fn has_previous(&self) -> bool {
        self.page > 1
    }

    pub fn item_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// A page change asked for by a render surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationRequest {
    pub user: Uuid,
    pub target: u32,
}

/// Navigation callback handed to a surface when it is presented
#[derive(Debug, Clone)]
pub struct Navigator {
    user: Uuid,
    page: u32,
    max_pages: u32,
    tx: mpsc::UnboundedSender<NavigationRequest>,
}

impl Navigator {
    pub(crate) fn new(
        user: Uuid,
        page: u32,
        max_pages: u32,
        tx: mpsc::UnboundedSender<NavigationRequest>,
    ) -> Self {
        Self {
            user,
            page,
            max_pages,
            tx,
        }
    }

    pub fn user(&self) -> Uuid {
        self.user
    }

    /// Ask for `target`. Returns false if it is out of range or nobody listens.
    pub fn go_to(&self, target: u32) -> bool {
        if target < 1 || target > self.max_pages {
            return false;
        }
        self.tx
            .send(NavigationRequest {
                user: self.user,
                target,
            })
            .is_ok()
    }

    pub fn next(&self) -> bool {
        self.go_to(self.page.saturating_add(1))
    }

    pub fn previous(&self) -> bool {
        self.go_to(self.page.saturating_sub(1))
    }
}

/// Produces visual surfaces for page views
pub trait Renderer: Send + Sync {
    /// Draw `view` and return the live surface
    fn present(&self, view: &PageView, navigator: Navigator) -> VaultResult<Box<dyn RenderSurface>>;
}

/// A page currently shown to a user
pub trait RenderSurface: Send {
    /// Live slot contents as the user sees them
    fn snapshot(&self) -> Vec<Option<ItemBlob>>;

    /// Replace the displayed contents
    fn redraw(&mut self, view: &PageView);

    /// Tear the surface down
    fn detach(self: Box<Self>);
}

/// Per-user capacity grants, read only
pub trait CapacityProvider: Send + Sync {
    /// Slot count granted to the user, if any
    fn slot_grant(&self, user: Uuid) -> Option<u32>;

    /// Page count granted to the user, if any
    fn page_grant(&self, user: Uuid) -> Option<u32>;
}

/// Grants nothing; mode defaults and record overrides apply
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCapacity;

impl CapacityProvider for DefaultCapacity {
    fn slot_grant(&self, _user: Uuid) -> Option<u32> {
        None
    }

    fn page_grant(&self, _user: Uuid) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigator_rejects_out_of_range() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let user = Uuid::new_v4();
        let nav = Navigator::new(user, 1, 2, tx);

        assert!(!nav.previous());
        assert!(!nav.go_to(3));
        assert!(nav.next());
        assert_eq!(rx.try_recv().unwrap(), NavigationRequest { user, target: 2 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn navigator_reports_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let nav = Navigator::new(Uuid::new_v4(), 1, 5, tx);
        assert!(!nav.next());
    }

    #[test]
    fn page_view_locks() {
        let view = PageView {
            user: Uuid::new_v4(),
            page: 1,
            slots: vec![None; 9],
            unlocked: 4,
            max_pages: 1,
        };
        assert!(!view.is_locked(3));
        assert!(view.is_locked(4));
        assert!(!view.has_next());
        assert!(!view.has_previous());
    }
}
