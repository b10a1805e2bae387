//! Backend implementations

pub mod sim;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use sim::{SimBuffer, SimConfig, SimDevice, SimFault, SimFile, SimStats};

#[cfg(feature = "cuda")]
pub use cuda::{CudaBackend, CudaBuffer, CudaConfig, CudaFile};
