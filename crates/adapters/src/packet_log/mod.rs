pub mod tracing_packet_logger;
