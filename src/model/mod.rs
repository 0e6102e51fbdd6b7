//! Model acquisition and device selection.

mod device;
mod loader;

pub use device::Device;
pub use loader::{ModelCache, ModelType, DEFAULT_INPAINT_REPO};
