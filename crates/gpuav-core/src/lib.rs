//! # GPU-assisted validation, shader-instrumentation core.
//!
//! Sits between the intercept chassis and the driver. For every creation
//! entry point that carries shader code, the core rewrites the binaries with
//! runtime checks (via [`spv_instrument`]), adapts the layouts so every
//! instrumented shader can reach the runtime's I/O buffers, and records
//! enough metadata to turn a GPU-side fault record back into a source
//! location.
//!
//! The chassis owns dispatch and object tracking; the core only ever mutates
//! the side copies the chassis hands it and never fails an application's
//! creation call. Anything that goes wrong is logged and, for
//! device-level failures, flips the core into an inert aborted state.

pub mod chassis;
pub mod diagnostic;
pub mod driver;
pub mod instrumentor;
pub mod intercept;
pub mod layout;
pub mod registry;
pub mod settings;

pub use instrumentor::{DeviceProfile, ShaderInstrumentor, MAX_ADJUSTED_BOUND_DESCRIPTOR_SET};
pub use registry::{InstrumentedShader, InstrumentedShaderRegistry};
pub use settings::{GpuavSettings, ShaderInstrumentationFlags};
