// Command-line surface of the daemon

use clap::Parser;

pub const MIN_LOGS_BUFFER: usize = 100;
pub const DEFAULT_LOGS_BUFFER: usize = 10_000;

#[derive(Parser, Debug, Clone)]
#[command(name = "whalewatch")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_TIME"), ")"))]
#[command(about = "Log and telemetry fabric for a local container engine", long_about = None)]
pub struct Cli {
    /// Hide container name prefixes (removes text up to the first underscore)
    #[arg(long)]
    pub demo: bool,

    /// Log resource gauges (tasks, file descriptors) on every watchdog tick
    #[arg(long)]
    pub debug_monitor: bool,

    /// Maximum log lines held by a logs viewport session (floor: 100)
    #[arg(long, default_value_t = DEFAULT_LOGS_BUFFER)]
    pub logs_buffer_length: usize,

    /// Serve the JSON-RPC gateway on /mcp
    #[arg(long)]
    pub mcp_server: bool,

    /// Gateway port
    #[arg(long, default_value_t = crate::rpc::DEFAULT_PORT)]
    pub mcp_port: u16,
}

impl Cli {
    /// Clamp values the rest of the process relies on.
    pub fn normalized(mut self) -> Self {
        if self.logs_buffer_length < MIN_LOGS_BUFFER {
            self.logs_buffer_length = MIN_LOGS_BUFFER;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let cli = Cli::parse_from(["whalewatch"]).normalized();
        assert!(!cli.demo);
        assert!(!cli.mcp_server);
        assert_eq!(cli.logs_buffer_length, DEFAULT_LOGS_BUFFER);
        assert_eq!(cli.mcp_port, 9876);
    }

    #[test]
    fn logs_buffer_length_is_floored() {
        let cli = Cli::parse_from(["whalewatch", "--logs-buffer-length", "10"]).normalized();
        assert_eq!(cli.logs_buffer_length, MIN_LOGS_BUFFER);
    }

    #[test]
    fn gateway_flags_parse() {
        let cli = Cli::parse_from(["whalewatch", "--mcp-server", "--mcp-port", "9000", "--demo"])
            .normalized();
        assert!(cli.mcp_server);
        assert!(cli.demo);
        assert_eq!(cli.mcp_port, 9000);
    }
}
