//! Media side of a meeting recorder bot: decodes the browser adapter's wire
//! messages and encodes them into a single FLV or MP4 artifact.

pub mod error;
pub mod ingest;
pub mod media;
pub mod monitor;
pub mod protocol;
pub mod scaler;
pub mod time_base;
