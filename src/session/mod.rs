//! Vault session coordination module

pub mod manager;
pub mod render;
pub mod state;

pub use manager::{CloseOutcome, SessionCoordinator};
pub use render::{
    CapacityProvider, DefaultCapacity, NavigationRequest, Navigator, PageView, RenderSurface,
    Renderer,
};
pub use state::{Session, SessionState};
