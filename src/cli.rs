use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kuberhealthy")]
#[command(about = "Synthetic health-check orchestrator for Kubernetes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Manage the HealthCheck CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the check scheduler, supervisor, reaper, and report ingress
    Operator {
        /// Address for the status-report ingress
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },

    /// Manage the legacy-conversion admission webhook
    Webhook {
        #[command(subcommand)]
        action: WebhookAction,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRDs into the connected cluster
    Install,
}

#[derive(Subcommand)]
pub enum WebhookAction {
    /// Start the conversion webhook HTTPS server
    Serve {
        #[arg(long, default_value = "0.0.0.0:8443")]
        addr: String,
        #[arg(long, default_value = "tls.crt")]
        tls_cert: String,
        #[arg(long, default_value = "tls.key")]
        tls_key: String,
    },
    /// Generate self-signed TLS certificates for development
    CertGenerate {
        #[arg(long, default_value = "kuberhealthy-webhook")]
        service_name: String,
        #[arg(long, default_value = "kuberhealthy")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: String,
        /// Additional IP SANs (e.g. --ip-san 192.168.1.26)
        #[arg(long = "ip-san")]
        ip_sans: Vec<String>,
    },
    /// Print the ValidatingWebhookConfiguration YAML
    InstallConfig {
        #[arg(long, default_value = "kuberhealthy-webhook")]
        service_name: String,
        #[arg(long, default_value = "kuberhealthy")]
        namespace: String,
        #[arg(long)]
        ca_bundle_path: String,
    },
}
