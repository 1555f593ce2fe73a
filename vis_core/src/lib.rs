pub mod artifact;
pub mod config;
pub mod context;
pub mod dataset;
pub mod gpu_types;
pub mod logging;
pub mod manipulation;
pub mod metric;
pub mod playback;
pub mod scene;
pub mod settings;
pub mod staging;


pub mod prelude {
    pub use crate::artifact::*;
    pub use crate::config::*;
    pub use crate::context::VisContext;
    pub use crate::dataset::*;
    pub use crate::logging::{init_logging, logging_active};
    pub use crate::manipulation::*;
    pub use crate::metric::*;
    pub use crate::playback::Playback;
    pub use crate::scene::{FrameReport, Scene};
    pub use crate::settings::{Persist, SettingsStore};
    pub use crate::staging::*;
}
