//! Vault records, pages and item payloads

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque item payload stored in a slot
///
/// The core never looks inside; encoding is the caller's business.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ItemBlob(Arc<[u8]>);

impl ItemBlob {
    /// Wrap raw payload bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    /// Payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload has no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ItemBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemBlob({} bytes)", self.0.len())
    }
}

impl From<&str> for ItemBlob {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<Vec<u8>> for ItemBlob {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

/// One numbered page of fixed-width slots
///
/// Pages are values: [`VaultPage::with_slot`] returns an updated copy.
/// [`VaultPage::set_slot`] mutates in place and is only used on the
/// coordinator's exclusive-writer path through the record cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPage {
    number: u32,
    slots: Box<[Option<ItemBlob>]>,
}

impl VaultPage {
    /// Create an all-empty page. Page numbers start at 1.
    pub fn empty(number: u32, width: usize) -> Self {
        debug_assert!(number >= 1, "page numbers start at 1");
        Self {
            number,
            slots: vec![None; width].into_boxed_slice(),
        }
    }

    /// Create a page from existing slot contents; the width is `slots.len()`
    pub fn from_slots(number: u32, slots: Vec<Option<ItemBlob>>) -> Self {
        debug_assert!(number >= 1, "page numbers start at 1");
        Self {
            number,
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// Number of slots (fixed at construction)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Item at `slot`, or `None` if empty or out of range
    pub fn get(&self, slot: usize) -> Option<&ItemBlob> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn slots(&self) -> &[Option<ItemBlob>] {
        &self.slots
    }

    /// Copy of this page with `slot` replaced; out-of-range slots leave it unchanged
    pub fn with_slot(&self, slot: usize, item: Option<ItemBlob>) -> Self {
        let mut page = self.clone();
        page.set_slot(slot, item);
        page
    }

    /// Replace `slot` in place. Returns false if the slot is out of range.
    pub fn set_slot(&mut self, slot: usize, item: Option<ItemBlob>) -> bool {
        match self.slots.get_mut(slot) {
            Some(current) => {
                *current = item;
                true
            }
            None => false,
        }
    }

    /// Copy of this page with every slot cleared
    pub fn cleared(&self) -> Self {
        Self::empty(self.number, self.len())
    }

    /// True when no slot holds an item
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn item_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Occupied slots in index order
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &ItemBlob)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|item| (i, item)))
    }
}

/// A user's complete vault state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultRecord {
    user: Uuid,
    pages: BTreeMap<u32, VaultPage>,
    custom_slots: u32,
    custom_pages: u32,
}

impl VaultRecord {
    pub fn new(
        user: Uuid,
        pages: BTreeMap<u32, VaultPage>,
        custom_slots: u32,
        custom_pages: u32,
    ) -> Self {
        Self {
            user,
            pages,
            custom_slots,
            custom_pages,
        }
    }

    /// Record with no pages and no overrides
    pub fn empty(user: Uuid) -> Self {
        Self::new(user, BTreeMap::new(), 0, 0)
    }

    pub fn user(&self) -> Uuid {
        self.user
    }

    pub fn pages(&self) -> &BTreeMap<u32, VaultPage> {
        &self.pages
    }

    /// Stored page, if any. An absent page is all-empty.
    pub fn page(&self, number: u32) -> Option<&VaultPage> {
        self.pages.get(&number)
    }

    /// Copy of the page, or an all-empty page of `width` if none is stored
    pub fn page_or_empty(&self, number: u32, width: usize) -> VaultPage {
        self.pages
            .get(&number)
            .cloned()
            .unwrap_or_else(|| VaultPage::empty(number, width))
    }

    /// Store a page under its own number
    pub fn set_page(&mut self, page: VaultPage) {
        self.pages.insert(page.number(), page);
    }

    pub fn remove_page(&mut self, number: u32) -> Option<VaultPage> {
        self.pages.remove(&number)
    }

    pub fn custom_slots(&self) -> u32 {
        self.custom_slots
    }

    pub fn custom_pages(&self) -> u32 {
        self.custom_pages
    }

    /// True when an admin slot override is set
    pub fn has_custom_slots(&self) -> bool {
        self.custom_slots > 0
    }

    /// True when an admin page override is set
    pub fn has_custom_pages(&self) -> bool {
        self.custom_pages > 0
    }

    pub fn set_custom_slots(&mut self, custom_slots: u32) {
        self.custom_slots = custom_slots;
    }

    pub fn set_custom_pages(&mut self, custom_pages: u32) {
        self.custom_pages = custom_pages;
    }

    pub fn with_custom_slots(mut self, custom_slots: u32) -> Self {
        self.custom_slots = custom_slots;
        self
    }

    pub fn with_custom_pages(mut self, custom_pages: u32) -> Self {
        self.custom_pages = custom_pages;
        self
    }

    pub fn item_count(&self) -> usize {
        self.pages.values().map(VaultPage::item_count).sum()
    }

    /// Same record with logically empty pages dropped
    pub fn without_empty_pages(mut self) -> Self {
        self.pages.retain(|_, page| !page.is_empty());
        self
    }

    /// Write the first `unlocked` slots of a page snapshot into this record.
    ///
    /// Slots past `unlocked` keep their stored contents. A page left with no
    /// items is dropped. Returns true if anything changed.
    pub fn write_slots(
        &mut self,
        number: u32,
        width: usize,
        snapshot: &[Option<ItemBlob>],
        unlocked: usize,
    ) -> bool {
        let mut page = self.page_or_empty(number, width);
        let limit = unlocked.min(snapshot.len()).min(page.len());
        let mut changed = false;

        for (slot, item) in snapshot.iter().enumerate().take(limit) {
            if page.slots()[slot] != *item {
                page.set_slot(slot, item.clone());
                changed = true;
            }
        }

        if changed {
            if page.is_empty() {
                self.pages.remove(&number);
            } else {
                self.pages.insert(number, page);
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_slot_leaves_original_untouched() {
        let page = VaultPage::empty(1, 9);
        let updated = page.with_slot(4, Some(ItemBlob::from("diamond")));

        assert!(page.is_empty());
        assert_eq!(updated.get(4), Some(&ItemBlob::from("diamond")));
        assert_eq!(updated.item_count(), 1);
        assert_eq!(updated.len(), 9);
    }

    #[test]
    fn out_of_range_slot_is_ignored() {
        let page = VaultPage::empty(2, 9);
        let same = page.with_slot(9, Some(ItemBlob::from("x")));
        assert_eq!(page, same);
        assert!(page.get(100).is_none());
    }

    #[test]
    fn occupied_yields_index_order() {
        let page = VaultPage::empty(1, 6)
            .with_slot(5, Some(ItemBlob::from("b")))
            .with_slot(1, Some(ItemBlob::from("a")));
        let slots: Vec<usize> = page.occupied().map(|(i, _)| i).collect();
        assert_eq!(slots, vec![1, 5]);
        assert!(page.cleared().is_empty());
    }

    #[test]
    fn absent_page_reads_as_empty() {
        let record = VaultRecord::empty(Uuid::new_v4());
        let page = record.page_or_empty(3, 52);
        assert_eq!(page.number(), 3);
        assert_eq!(page.len(), 52);
        assert!(page.is_empty());
        assert!(record.page(3).is_none());
    }

    #[test]
    fn write_slots_respects_locked_region() {
        let mut record = VaultRecord::empty(Uuid::new_v4());
        let mut snapshot = vec![None; 9];
        snapshot[2] = Some(ItemBlob::from("kept"));
        snapshot[7] = Some(ItemBlob::from("locked"));

        assert!(record.write_slots(1, 9, &snapshot, 5));
        let page = record.page(1).unwrap();
        assert_eq!(page.get(2), Some(&ItemBlob::from("kept")));
        assert!(page.get(7).is_none());

        // unchanged snapshot is not a change
        assert!(!record.write_slots(1, 9, &snapshot, 5));
    }

    #[test]
    fn write_slots_drops_emptied_page() {
        let mut record = VaultRecord::empty(Uuid::new_v4());
        let mut snapshot = vec![None; 9];
        snapshot[0] = Some(ItemBlob::from("a"));
        record.write_slots(1, 9, &snapshot, 9);
        assert_eq!(record.pages().len(), 1);

        assert!(record.write_slots(1, 9, &vec![None; 9], 9));
        assert!(record.pages().is_empty());
    }

    #[test]
    fn overrides_and_normalisation() {
        let user = Uuid::new_v4();
        let mut record = VaultRecord::empty(user).with_custom_slots(45);
        record.set_page(VaultPage::empty(2, 9));
        record.set_page(VaultPage::empty(1, 9).with_slot(0, Some(ItemBlob::from("a"))));

        assert!(record.has_custom_slots());
        assert!(!record.has_custom_pages());
        assert_eq!(record.item_count(), 1);

        let normalised = record.without_empty_pages();
        assert_eq!(normalised.pages().keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(normalised.user(), user);
    }

    #[test]
    fn blob_debug_hides_contents() {
        let blob = ItemBlob::from("secret");
        assert_eq!(format!("{:?}", blob), "ItemBlob(6 bytes)");
        assert_eq!(blob.len(), 6);
        assert!(!blob.is_empty());
    }
}
