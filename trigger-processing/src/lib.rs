//! Trigger detection and event building on continuous detector waveforms.
//!
//! Blocks read from a [source::WaveformSource] are passed through a matched
//! filter on every trigger channel, thresholded with pileup suppression,
//! merged across channels into coincident [event::Event]s, and streamed in
//! bounded partitions to an [sink::OutputSink]. Series are split between
//! independent workers by [dispatch::dispatch].
pub mod channels;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod event_builder;
pub mod filter;
pub mod parameters;
pub mod partition;
pub mod processing;
pub mod setup;
pub mod simulation;
pub mod sink;
pub mod source;
pub mod trigger;
