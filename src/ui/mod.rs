//! Terminal output for the vaultd CLI
//!
//! Plain styled lines via `console`, which drops colors on its own when
//! stdout is not a terminal. The [`ConsoleRenderer`] draws vault pages as
//! text grids for the serve loop.

mod output;
mod pages;

pub use output::{
    key_value, section, step_error, step_info, step_ok, step_ok_detail, step_warn,
    step_warn_hint,
};
pub use pages::{format_page, ConsoleRenderer};
