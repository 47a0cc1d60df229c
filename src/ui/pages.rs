//! Text rendering of vault pages

use crate::error::VaultResult;
use crate::session::{Navigator, PageView, RenderSurface, Renderer};
use crate::vault::ItemBlob;
use console::style;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Cells per printed row
const ROW_WIDTH: usize = 9;

/// Characters of an item label shown in a cell
const CELL_WIDTH: usize = 6;

type NavigatorTable = Arc<Mutex<HashMap<Uuid, Navigator>>>;

/// Draws page views to stdout and remembers each user's navigator
#[derive(Default)]
pub struct ConsoleRenderer {
    navigators: NavigatorTable,
}

impl ConsoleRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Navigator of the surface currently shown to `user`
    pub fn navigator(&self, user: Uuid) -> Option<Navigator> {
        lock(&self.navigators).get(&user).cloned()
    }
}

impl Renderer for ConsoleRenderer {
    fn present(&self, view: &PageView, navigator: Navigator) -> VaultResult<Box<dyn RenderSurface>> {
        lock(&self.navigators).insert(view.user, navigator);
        println!("{}", format_page(view));
        Ok(Box::new(ConsoleSurface {
            view: view.clone(),
            navigators: Arc::clone(&self.navigators),
        }))
    }
}

struct ConsoleSurface {
    view: PageView,
    navigators: NavigatorTable,
}

impl RenderSurface for ConsoleSurface {
    fn snapshot(&self) -> Vec<Option<ItemBlob>> {
        self.view.slots.clone()
    }

    fn redraw(&mut self, view: &PageView) {
        self.view = view.clone();
        println!("{}", format_page(view));
    }

    fn detach(self: Box<Self>) {
        lock(&self.navigators).remove(&self.view.user);
        println!(
            "{} vault {} page {}",
            style("closed").dim(),
            self.view.user,
            self.view.page
        );
    }
}

fn lock(table: &NavigatorTable) -> MutexGuard<'_, HashMap<Uuid, Navigator>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Format a page as a header line followed by rows of cells
///
/// Empty slots print as dots, locked slots as hashes.
pub fn format_page(view: &PageView) -> String {
    let mut out = format!(
        "vault {} page {}/{} ({} items, {} unlocked)",
        view.user,
        view.page,
        view.max_pages,
        view.item_count(),
        view.unlocked.min(view.slots.len())
    );

    for (row, cells) in view.slots.chunks(ROW_WIDTH).enumerate() {
        out.push_str(&format!("\n  {:>2} ", row * ROW_WIDTH + 1));
        for (offset, slot) in cells.iter().enumerate() {
            let index = row * ROW_WIDTH + offset;
            out.push('[');
            out.push_str(&cell(slot.as_ref(), view.is_locked(index)));
            out.push(']');
        }
    }
    out
}

fn cell(item: Option<&ItemBlob>, locked: bool) -> String {
    match item {
        Some(item) => {
            let label: String = String::from_utf8_lossy(item.as_bytes())
                .chars()
                .take(CELL_WIDTH)
                .collect();
            format!("{:<width$}", label, width = CELL_WIDTH)
        }
        None if locked => "#".repeat(CELL_WIDTH),
        None => ".".repeat(CELL_WIDTH),
    }
}
