use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use log::error;

pub mod icmp;
pub use icmp::IcmpProber;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resolve {address}: {reason}")]
    Resolve { address: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Turns a target address into the IP to probe.  Called once, before
    /// the monitor task for the target is built.
    async fn resolve(&self, address: &str) -> Result<IpAddr, Error>;

    /// Sends one echo request and waits for its reply.  `Ok(None)` means
    /// the reply did not arrive within `timeout`.
    async fn ping(&self, target: IpAddr, seq: u16, timeout: Duration)
        -> Result<Option<Duration>, Error>;
}

/// Resolves target addresses, IP literals are taken as they are.
#[derive(Clone)]
pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    /// Uses the system resolver configuration, or the default upstream
    /// servers when it cannot be read.
    pub fn from_system_conf() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            error!(
                "Failed to load system resolv.conf: {}. Falling back to Google DNS.",
                e
            );
            TokioAsyncResolver::tokio(Default::default(), Default::default())
        });

        Self { inner }
    }

    pub async fn lookup(&self, address: &str) -> Result<IpAddr, Error> {
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Ok(ip);
        }

        let lookup = self
            .inner
            .lookup_ip(address)
            .await
            .map_err(|err| Error::Resolve {
                address: address.to_string(),
                reason: err.to_string(),
            })?;

        lookup.iter().next().ok_or_else(|| Error::Resolve {
            address: address.to_string(),
            reason: "no addresses found".into(),
        })
    }
}
