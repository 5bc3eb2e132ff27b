/* Rendering engine: the RGBA render target, the accelerated compositing
 * kernels and the per-device animation loop. */

pub mod accel;
pub mod rloop;
pub mod target;

pub use rloop::{LedDevice, RenderLoop};
pub use target::{blend, multiply, RGBAColor, RenderTarget};
