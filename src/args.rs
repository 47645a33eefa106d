use std::path::{Path, PathBuf};

use clap::Parser;
use tpm2_proxy::{address::SocketEndpoint, driver::PassiveConfig};

/// Man-in-the-middle proxy between a TPM2 TCTI client and an swtpm simulator.
///
/// Connects to the simulator's control and data channels, listens for the bridging helper on the
/// backend endpoints, and relays everything between both sides.
#[derive(Parser, Debug, Clone)]
#[command(name = "tpm2-proxy", version, about)]
pub struct StartupArguments {
    /// Control channel of the running simulator, e.g. `tcp:port=2322` or `type=unixio,path=/run/ctrl`
    #[arg(long, value_name = "ADDR")]
    pub upstream_control: SocketEndpoint,

    /// Data channel of the running simulator, e.g. `tcp:port=2321`
    #[arg(long, value_name = "ADDR")]
    pub upstream_data: SocketEndpoint,

    /// Control address the bridging helper exposes to the TPM client, passed to the helper as-is
    #[arg(long, value_name = "ADDR")]
    pub frontend_control: String,

    /// Where to listen for the helper's control connection [default: ephemeral localhost port]
    #[arg(long, value_name = "ADDR")]
    pub backend_control: Option<SocketEndpoint>,

    /// Where to listen for the helper's data connection [default: ephemeral localhost port]
    #[arg(long, value_name = "ADDR")]
    pub backend_data: Option<SocketEndpoint>,

    /// Bridging helper program
    #[arg(long, value_name = "PROGRAM", default_value = "swtpm_proxy")]
    pub helper: PathBuf,

    /// Extra argument for the helper, placed before the generated ones (repeatable)
    #[arg(long = "helper-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub helper_args: Vec<String>,

    /// Write a packet capture to this file, or to a timestamped file if this is a directory
    #[arg(long, value_name = "PATH")]
    pub pcap: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl StartupArguments {
    pub fn passive_config(&self) -> PassiveConfig {
        let mut config = PassiveConfig::new(self.frontend_control.clone());
        if let Some(control) = &self.backend_control {
            config.backend_control = control.clone();
        }
        if let Some(data) = &self.backend_data {
            config.backend_data = data.clone();
        }

        config
    }

    /// The file to write the packet capture to, if capturing was requested.
    pub fn capture_path(&self, unix_millis: u128) -> Option<PathBuf> {
        self.pcap.as_deref().map(|path| resolve_capture_path(path, unix_millis))
    }
}

fn resolve_capture_path(path: &Path, unix_millis: u128) -> PathBuf {
    if path.is_dir() {
        path.join(format!("tpm-capture-{unix_millis}.pcap"))
    } else {
        path.to_path_buf()
    }
}
