//! ffmpeg command construction for the stream and the relay

pub mod ffmpeg;
pub mod filter;
pub mod relay;

pub use ffmpeg::{build_stream_command, stream_args, EncodeSettings, InputSource, StreamParams};
pub use filter::{build_filter_graph, escape_drawtext, overlay_filters};
pub use relay::{build_relay_command, relay_args, relay_input_url, relay_output_url, RelayParams};
