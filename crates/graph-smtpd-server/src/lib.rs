//! Shared setup for the graph-smtpd binaries

pub mod logging;
