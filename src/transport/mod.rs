// MIT License - Copyright (c) 2026 Peter Wright
// Line transport: framing, response correlation and the TCP connection

pub mod connection;
pub mod correlator;
pub mod framer;

pub use connection::Connection;
pub use correlator::{ResponseCorrelator, ResponseMatch};
