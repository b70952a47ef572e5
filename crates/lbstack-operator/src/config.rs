//! Controller configuration
//!
//! Parsed once from flags and environment at startup into an immutable
//! [`ControllerConfig`] that is handed to every component at construction.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use lbstack_common::retry::RetryConfig;
use lbstack_common::{Error, Result, DEFAULT_INGRESS_CLASS};
use lbstack_model::resource::{Protocol, Scheme, TargetType};
use lbstack_model::settings::ListenPort;
use lbstack_model::{ClassMatcher, LoadBalancerSettings};

/// Default Service `loadBalancerClass` handled by this controller
pub const DEFAULT_LOAD_BALANCER_CLASS: &str = "service.lbstack.io/nlb";

/// lbstack - provisions load balancers for Services and Ingresses
#[derive(Parser, Debug, Clone)]
#[command(name = "lbstack-operator", version, about, long_about = None)]
pub struct ControllerConfig {
    /// Cluster name, used as the prefix of every stack ID
    #[arg(long, env = "LBSTACK_CLUSTER_NAME")]
    pub cluster_name: String,

    /// Ingress class handled by this controller
    #[arg(long, env = "LBSTACK_INGRESS_CLASS", default_value = DEFAULT_INGRESS_CLASS)]
    pub ingress_class: String,

    /// Service loadBalancerClass handled by this controller
    #[arg(long, env = "LBSTACK_LOAD_BALANCER_CLASS", default_value = DEFAULT_LOAD_BALANCER_CLASS)]
    pub load_balancer_class: String,

    /// Subnets available for load balancer placement (comma-separated)
    #[arg(long, env = "LBSTACK_SUBNETS", value_delimiter = ',', required = true)]
    pub subnets: Vec<String>,

    /// Security group shared by every load balancer for node access
    #[arg(long, env = "LBSTACK_SHARED_BACKEND_SECURITY_GROUP")]
    pub shared_backend_security_group: Option<String>,

    /// Default load balancer scheme (internal or internet-facing)
    #[arg(long, env = "LBSTACK_SCHEME", default_value = "internal")]
    pub scheme: Scheme,

    /// Default target type (instance or ip)
    #[arg(long, env = "LBSTACK_TARGET_TYPE", default_value = "instance")]
    pub target_type: TargetType,

    /// Ingress listen ports as PROTOCOL:PORT (comma-separated)
    #[arg(
        long,
        env = "LBSTACK_LISTEN_PORTS",
        value_delimiter = ',',
        default_value = "HTTP:80",
        value_parser = parse_listen_port
    )]
    pub listen_ports: Vec<ListenPort>,

    /// Certificate for HTTPS listeners
    #[arg(long, env = "LBSTACK_CERTIFICATE_ARN")]
    pub certificate_arn: Option<String>,

    /// Explicit security groups for ingress load balancers (comma-separated)
    #[arg(long, env = "LBSTACK_SECURITY_GROUPS", value_delimiter = ',')]
    pub security_groups: Vec<String>,

    /// Source ranges admitted by managed security groups (comma-separated)
    #[arg(long, env = "LBSTACK_INBOUND_CIDRS", value_delimiter = ',', default_value = "0.0.0.0/0")]
    pub inbound_cidrs: Vec<String>,

    /// Health check path for HTTP target groups
    #[arg(long, env = "LBSTACK_HEALTH_CHECK_PATH", default_value = "/")]
    pub health_check_path: String,

    /// Maximum concurrent reconciles per watched kind
    #[arg(long, env = "LBSTACK_MAX_CONCURRENT_RECONCILES", default_value_t = 3)]
    pub max_concurrent_reconciles: u16,

    /// Deadline for one reconcile attempt, in seconds
    #[arg(long, env = "LBSTACK_RECONCILE_TIMEOUT_SECS", default_value_t = 300)]
    pub reconcile_timeout_secs: u64,

    /// Attempts per converge step before a transient failure surfaces
    #[arg(long, env = "LBSTACK_CONVERGE_RETRY_ATTEMPTS", default_value_t = 5)]
    pub converge_retry_attempts: u32,

    /// Concurrent infrastructure calls within one converge step
    #[arg(long, env = "LBSTACK_DEPLOY_CONCURRENCY", default_value_t = 8)]
    pub deploy_concurrency: usize,

    /// Emit JSON logs
    #[arg(long, env = "LBSTACK_LOG_JSON")]
    pub log_json: bool,

    /// Path to a kubeconfig; in-cluster or default config when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Artificial latency of the in-memory infrastructure backend, in milliseconds
    #[arg(long, env = "LBSTACK_CLOUD_LATENCY_MS", default_value_t = 0)]
    pub cloud_latency_ms: u64,
}

/// Parse `PROTOCOL:PORT`, e.g. `HTTPS:443`
pub fn parse_listen_port(s: &str) -> std::result::Result<ListenPort, String> {
    let (protocol, port) = s
        .split_once(':')
        .ok_or_else(|| format!("listen port '{s}' must be PROTOCOL:PORT"))?;
    let protocol: Protocol = protocol.trim().parse()?;
    if !matches!(protocol, Protocol::Http | Protocol::Https) {
        return Err(format!("ingress listeners must be HTTP or HTTPS, got {protocol}"));
    }
    let port = port
        .trim()
        .parse::<u16>()
        .map_err(|e| format!("invalid port in '{s}': {e}"))?;
    Ok(ListenPort { port, protocol })
}

impl ControllerConfig {
    /// Reject combinations clap cannot express
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(Error::validation_for_field("config", "cluster-name", "must not be empty"));
        }
        if self.subnets.iter().all(|s| s.trim().is_empty()) {
            return Err(Error::validation_for_field(
                "config",
                "subnets",
                "at least one subnet is required",
            ));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::validation_for_field(
                "config",
                "max-concurrent-reconciles",
                "must be at least 1",
            ));
        }
        if self.converge_retry_attempts == 0 {
            return Err(Error::validation_for_field(
                "config",
                "converge-retry-attempts",
                "must be at least 1",
            ));
        }
        if self.deploy_concurrency == 0 {
            return Err(Error::validation_for_field(
                "config",
                "deploy-concurrency",
                "must be at least 1",
            ));
        }
        if self.reconcile_timeout_secs == 0 {
            return Err(Error::validation_for_field(
                "config",
                "reconcile-timeout-secs",
                "must be at least 1",
            ));
        }
        let needs_certificate = self.listen_ports.iter().any(|p| p.protocol.needs_certificate());
        if needs_certificate && self.certificate_arn.is_none() {
            return Err(Error::validation_for_field(
                "config",
                "certificate-arn",
                "HTTPS listen ports require a certificate",
            ));
        }
        Ok(())
    }

    /// Controller-wide load balancer settings
    pub fn settings(&self) -> LoadBalancerSettings {
        LoadBalancerSettings {
            scheme: self.scheme,
            target_type: self.target_type,
            listen_ports: self.listen_ports.clone(),
            certificate_arn: self.certificate_arn.clone(),
            security_groups: self.security_groups.clone(),
            health_check_path: self.health_check_path.clone(),
            inbound_cidrs: self.inbound_cidrs.clone(),
        }
    }

    /// Class matcher for the configured classes
    pub fn class_matcher(&self) -> ClassMatcher {
        ClassMatcher::new(&self.ingress_class, &self.load_balancer_class)
    }

    /// Retry policy for a single converge step
    pub fn converge_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.converge_retry_attempts,
            ..RetryConfig::converge()
        }
    }

    /// Deadline for one reconcile attempt
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }
}
