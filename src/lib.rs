//! Core library for the saxs_stream pipeline.
//!
//! Raw detector frames are discovered in a run catalog, delivered exactly
//! once and in order as a Start/Frame/Stop event stream, reduced to 1-D
//! curves or latent-space vectors, and republished to live clients and back
//! into the catalog. The delivery drivers ([`driver`]) bind the sequencing
//! core ([`sequencer`], [`tracker`]) to a catalog ([`catalog`]) and a
//! message channel ([`channel`]).

pub mod catalog;
pub mod channel;
pub mod config;
pub mod driver;
pub mod error;
pub mod messages;
pub mod publisher;
pub mod recovery;
pub mod reduce;
pub mod sequencer;
pub mod shutdown;
pub mod sim;
pub mod tracker;
