use thiserror::Error;

/// Errors from setting up the engine. Instrumentation and propagation never
/// fail; see `UnhandledHandling` for how coverage gaps are reported.
#[derive(Error, Debug)]
pub enum Error {
    #[error("address space of {0:#x} bytes is empty or exceeds 4 GiB")]
    InvalidAddressSpace(u64),
    #[error("failed to allocate {bytes} bytes of shadow memory")]
    ShadowAlloc { bytes: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
