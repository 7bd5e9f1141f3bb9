// src/drivers/mod.rs
pub mod acquisition;
pub mod buffer;
pub mod demux;
pub mod error;
pub mod fanout;
pub mod plot;
pub mod plotter;
pub mod psd;
pub mod source;
pub use acquisition::AcquisitionThread;
pub use buffer::{SignalBuffer, TimeSeriesFrame};
pub use demux::MuxLayout;
pub use error::AcqError;
pub use fanout::{FanOut, SubscriberStats};
pub use plot::{render_spectrum_png, render_waveform_png, PlotStyle};
pub use plotter::{BlockView, Plotter, PlotterSettings, ViewWorker, YScale};
pub use psd::{PsdFrame, PsdPlotter, PsdScaling, PsdSettings};
#[cfg(test)]
pub use source::ManualSource;
pub use source::{MuxSource, SimSettings, SimulatedMux};
