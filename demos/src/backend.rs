//! Backend used by the FCN binaries, picked at compile time by cargo feature.
//!
//! `cuda` wins over `wgpu`; without either the CPU `ndarray` backend is used.
//! Training wraps [`SelectedBackend`] in `Autodiff`, inference runs it bare.

use cfg_if::cfg_if;

/// Tensor backends the binaries can be built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Cuda,
    Wgpu,
    NdArray,
}

impl BackendKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cuda => "CUDA (NVIDIA GPU)",
            Self::Wgpu => "WGPU (GPU)",
            Self::NdArray => "NdArray (CPU)",
        }
    }

    /// GPU backends; training on anything else only warns.
    pub const fn is_accelerated(self) -> bool {
        matches!(self, Self::Cuda | Self::Wgpu)
    }
}

cfg_if! {
    if #[cfg(feature = "cuda")] {
        pub type SelectedBackend = burn::backend::Cuda;
        pub const BACKEND: BackendKind = BackendKind::Cuda;
    } else if #[cfg(feature = "wgpu")] {
        pub type SelectedBackend = burn::backend::Wgpu;
        pub const BACKEND: BackendKind = BackendKind::Wgpu;
    } else {
        pub type SelectedBackend = burn::backend::NdArray;
        pub const BACKEND: BackendKind = BackendKind::NdArray;
    }
}

pub type SelectedDevice = <SelectedBackend as burn::tensor::backend::Backend>::Device;

/// Default device of [`SelectedBackend`] (first GPU, or the CPU).
pub fn create_device() -> SelectedDevice {
    SelectedDevice::default()
}
