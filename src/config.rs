use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5000;

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub host: IpAddr,
    /// Abandon a build that has not reported completion within this time
    pub build_timeout: Option<Duration>,
    /// How long `stop` waits for sessions to close before aborting them
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            build_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}
