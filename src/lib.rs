#![doc(html_root_url = "https://docs.rs/wirepipe/latest")]
//! Duplex-stream multiplexing for RPC sessions.
//!
//! `wirepipe` lets two connected peers open any number of independent,
//! flow-controlled, bidirectional byte streams ("pipes") riding inside the
//! single ordered message stream of one physical connection. The owning
//! session supplies the transport through [`SessionLink`]; dispatch, typed
//! channels and transports live in other layers.
//!
//! A [`PipeManager`] multiplexes pooled [`Pipe`] instances; each pipe owns a
//! [`PipeReader`] and a [`PipeWriter`], the asynchronous endpoints handed to
//! application code. Backpressure is three-tiered: an advisory high water
//! mark that pauses the remote writer, a hard cutoff that drops data from a
//! stalled consumer, and a low water mark that resumes the flow.

pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod pipe;
mod pool;
pub mod reader;
pub mod session;
pub mod state;
pub mod writer;

pub use config::WatermarkConfig;
pub use error::PipeError;
pub use manager::PipeManager;
pub use pipe::{Pipe, PipeId};
pub use reader::{BufferStatus, PipeReader, ReadOutcome};
pub use session::{MessageKind, SendError, SessionLink};
pub use state::{PipeFlags, Role};
pub use writer::{FlushOutcome, PipeWriter, Reservation};
