pub mod channel_exporter;
pub mod json_lines_writer;
