//! # Axiom Backend Library
//!
//! The device layer of the Axiom compositor: backends that discover input
//! devices and outputs, and the plumbing they share.
//!
//! ## Architecture
//!
//! - `signal`: synchronous signal/listener bus used by everything below
//! - `event_loop`: one-shot timers from the host event loop
//! - `session`: privileged device access and DRM master handling
//! - `input`: input device records and their typed payloads
//! - `output`: outputs announced by backends
//! - `global`: advertised globals and their deferred destruction
//! - `backend`: the `Backend` trait with headless, libinput, DRM and
//!   multi-backend implementations
//! - `config`: configuration parsing and management
//!
//! Everything here is single-threaded and lives on the thread running the
//! event loop.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use axiom_backend::{autocreate, Backend, BackendConfig, ManualEventLoop};
//! use std::rc::Rc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = BackendConfig::default();
//!     let backend = autocreate(&config, Rc::new(ManualEventLoop::new()), None)?;
//!     let _listener = backend.events().new_output.connect(|output| {
//!         println!("new output {}", output.name());
//!     });
//!     backend.start();
//!     backend.destroy();
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod event_loop;
pub mod global;
pub mod input;
pub mod output;
pub mod session;
pub mod signal;

// Re-export main types for easy access
pub use backend::drm::matcher::{match_obj, SKIP, UNMATCHED};
pub use backend::{
    autocreate, Backend, BackendError, BackendKind, BackendState, BufferCaps, ClockId, DrmBackend,
    HeadlessBackend, LibinputBackend, MultiBackend,
};
pub use config::BackendConfig;
pub use event_loop::{CalloopEventLoop, EventLoop, ManualEventLoop, TimerError, TimerHandle};
pub use global::{destroy_safe, DestroyOutcome, Global, GlobalRegistry, GLOBAL_DESTROY_DELAY};
pub use input::{InputDevice, InputDeviceType};
pub use output::Output;
pub use session::{DirectSession, Session};
pub use signal::{Listener, Signal};

/// Version information for Axiom
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
