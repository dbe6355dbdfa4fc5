use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Path of the runner configuration file.
    #[arg(short = 'c', long, default_value = "/etc/opt/vmrunner/config.yaml")]
    pub config: PathBuf,

    /// Name of the VirtualMachine resource this runner hosts.
    #[arg(long, env = "VM_NAME", required = true)]
    pub vm_name: String,

    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    #[arg(long, env = "NODE_IP")]
    pub node_ip: Option<String>,

    /// Skip patching the VM status; useful when running outside a cluster.
    #[arg(long, env = "NO_STATUS")]
    pub no_status: bool,
}
