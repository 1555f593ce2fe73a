pub mod interface;
pub mod notify;
pub mod recording;
pub mod util;


pub mod prelude {
    pub use crate::interface::*;
    pub use crate::notify::*;
    pub use crate::recording::{RecordingBackend, RecordingHandle};
}
