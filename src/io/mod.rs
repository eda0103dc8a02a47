//! Acquisition sources and layer sinks

pub mod acquisition;
pub mod sink;

pub use acquisition::{Acquisition, AcquisitionFilter, AcquisitionSource, MemorySource};
pub use sink::{LayerSink, MemorySink};
