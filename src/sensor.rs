mod device;
mod reading;

pub use device::*;
pub use reading::*;
