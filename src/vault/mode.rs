//! Operational modes and capacity math
//!
//! Each mode carries its own defaults and slot/page calculation. The mode is
//! built once from configuration and handed to whoever needs it.

use crate::config::schema::{ModeName, VaultConfig, MAX_PAGES};
use crate::vault::record::VaultRecord;

/// Storage width of a Simple-mode page
pub const SIMPLE_PAGE_WIDTH: usize = 54;

/// Storage width of a Paged-mode page
pub const PAGED_PAGE_WIDTH: usize = 52;

/// Single-page vault sized by slot grants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleLayout {
    pub default_slots: u32,
}

/// Multi-page vault with fixed-width pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagedLayout {
    pub default_slots: u32,
    pub default_pages: u32,
}

/// Resolved limits for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Slots the user may place items in, counted from slot 0
    pub unlocked_slots: usize,
    /// Highest page the user may open
    pub max_pages: u32,
}

/// Vault operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultMode {
    Simple(SimpleLayout),
    Paged(PagedLayout),
}

impl VaultMode {
    /// Build the mode from (validated) vault configuration
    pub fn from_config(config: &VaultConfig) -> Self {
        match config.mode {
            ModeName::Simple => Self::Simple(SimpleLayout {
                default_slots: config.simple_slots,
            }),
            ModeName::Paged => Self::Paged(PagedLayout {
                default_slots: config.paged_slots,
                default_pages: config.paged_pages,
            }),
        }
    }

    /// Slots per stored page
    pub fn page_width(&self) -> usize {
        match self {
            Self::Simple(_) => SIMPLE_PAGE_WIDTH,
            Self::Paged(_) => PAGED_PAGE_WIDTH,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Simple(_) => "simple",
            Self::Paged(_) => "paged",
        }
    }

    /// Unlocked slot count: record override, then grant, then the default
    pub fn max_slots(&self, record: &VaultRecord, grant: Option<u32>) -> usize {
        let width = self.page_width();
        let chosen = if record.has_custom_slots() {
            record.custom_slots()
        } else {
            match self {
                Self::Simple(layout) => grant.unwrap_or(layout.default_slots),
                Self::Paged(layout) => grant.unwrap_or(layout.default_slots),
            }
        };
        (chosen as usize).min(width)
    }

    /// Page count: always 1 in Simple mode, otherwise override, grant, default
    pub fn max_pages(&self, record: &VaultRecord, grant: Option<u32>) -> u32 {
        match self {
            Self::Simple(_) => 1,
            Self::Paged(layout) => {
                let chosen = if record.has_custom_pages() {
                    record.custom_pages()
                } else {
                    grant.unwrap_or(layout.default_pages)
                };
                chosen.clamp(1, MAX_PAGES)
            }
        }
    }

    /// Resolve both limits at once
    pub fn capacity(
        &self,
        record: &VaultRecord,
        slot_grant: Option<u32>,
        page_grant: Option<u32>,
    ) -> Capacity {
        Capacity {
            unlocked_slots: self.max_slots(record, slot_grant),
            max_pages: self.max_pages(record, page_grant),
        }
    }
}

impl Default for VaultMode {
    fn default() -> Self {
        Self::from_config(&VaultConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn paged() -> VaultMode {
        VaultMode::Paged(PagedLayout {
            default_slots: 27,
            default_pages: 2,
        })
    }

    fn simple() -> VaultMode {
        VaultMode::Simple(SimpleLayout { default_slots: 27 })
    }

    #[test]
    fn from_config_selects_variant() {
        let mut config = VaultConfig::default();
        assert!(matches!(VaultMode::from_config(&config), VaultMode::Paged(_)));

        config.mode = ModeName::Simple;
        let mode = VaultMode::from_config(&config);
        assert_eq!(mode, VaultMode::Simple(SimpleLayout { default_slots: 27 }));
        assert_eq!(mode.page_width(), 54);
        assert_eq!(mode.name(), "simple");
    }

    #[test]
    fn override_beats_grant_and_default() {
        let record = VaultRecord::empty(Uuid::new_v4()).with_custom_slots(45);
        assert_eq!(paged().max_slots(&record, Some(9)), 45);

        let plain = VaultRecord::empty(Uuid::new_v4());
        assert_eq!(paged().max_slots(&plain, Some(36)), 36);
        assert_eq!(paged().max_slots(&plain, None), 27);
    }

    #[test]
    fn slots_are_capped_at_page_width() {
        let record = VaultRecord::empty(Uuid::new_v4()).with_custom_slots(54);
        assert_eq!(paged().max_slots(&record, None), 52);
        assert_eq!(simple().max_slots(&record, None), 54);
    }

    #[test]
    fn simple_mode_has_one_page() {
        let record = VaultRecord::empty(Uuid::new_v4()).with_custom_pages(4);
        assert_eq!(simple().max_pages(&record, Some(5)), 1);
    }

    #[test]
    fn paged_pages_are_capped() {
        let record = VaultRecord::empty(Uuid::new_v4()).with_custom_pages(9);
        assert_eq!(paged().max_pages(&record, None), 5);

        let plain = VaultRecord::empty(Uuid::new_v4());
        assert_eq!(paged().max_pages(&plain, Some(3)), 3);
        assert_eq!(paged().max_pages(&plain, None), 2);

        let capacity = paged().capacity(&plain, None, Some(4));
        assert_eq!(
            capacity,
            Capacity {
                unlocked_slots: 27,
                max_pages: 4
            }
        );
    }
}
