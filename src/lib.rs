//! Host-side driver core for Hantek DSO-2xxx/5xxx USB oscilloscopes
//! (DSO-2090, DSO-2090A, DSO-2150, DSO-2250, DSO-5200, DSO-5200A).
//!
//! The crate covers the three hard parts of talking to these scopes:
//!
//! * the **USB transport**: a claimed vendor interface with one bulk
//!   endpoint in each direction, a mandatory begin-command control preamble
//!   before every bulk command, speed renegotiation before every bulk
//!   transfer, and multi-packet sample reads sized by the negotiated link
//!   speed ([`device`]),
//! * the **wire codec**: the family of fixed-length command frames with
//!   packed bitfields and split multi-byte fields, several of them sharing
//!   opcodes between device families ([`bulk`], [`control`]),
//! * the **acquisition state machine**: configure, arm, poll the capture
//!   state, fetch and decode the sample ring, publish the result
//!   ([`engine`], [`config`], [`samples`]).
//!
//! Rendering, analysis, export and persistence are external collaborators:
//! they apply settings through [`DsoHandle`], take decoded captures from
//! the result slot and listen on the event stream.
//!
//! ```no_run
//! use hantek_dso::{model, Dso, SettingsSnapshot};
//!
//! # async fn example() -> Result<(), hantek_dso::DsoError> {
//! let dso = Dso::connect(&model::DSO2090).await?;
//! let handle = dso.handle.clone();
//! tokio::spawn(dso.engine.run());
//!
//! handle.apply_settings(SettingsSnapshot::default())?;
//! handle.start_capture();
//! handle.result_ready().await;
//! if let Some(capture) = handle.take_result() {
//!     println!("{} samples", capture.channels[0].as_ref().map_or(0, |ch| ch.voltage.len()));
//! }
//! # Ok(())
//! # }
//! ```

pub mod bulk;
pub mod config;
pub mod control;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod firmware;
pub mod frame;
pub mod model;
pub mod samples;
pub mod settings;

pub use device::{UsbSession, UsbTransport};
pub use engine::{build_engine, AcquisitionEngine, Dso, DsoEvent, DsoHandle};
pub use error::DsoError;
pub use model::{DeviceModel, ModelDescriptor};
pub use samples::{CaptureResult, ChannelCapture};
pub use settings::SettingsSnapshot;
