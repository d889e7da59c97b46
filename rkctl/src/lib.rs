//! Building blocks of the `rkctl` administrative CLI.

pub mod data_source;
pub mod operator;
pub mod output;
