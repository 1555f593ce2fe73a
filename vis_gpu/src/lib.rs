pub mod backend;
pub mod context;
pub mod kernels;

pub mod prelude {
    pub use crate::backend::WgpuBackend;
    pub use crate::context::{GpuContext, GpuInitError};
}
