use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::task::TaskOptions;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub global: Global,
    pub cluster: Cluster,
    pub http: Http,
    pub tasks: Tasks,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Global {
    /// Added to the metrics of every monitored target.
    pub external_labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Cluster {
    /// Nodes sharing a cluster name share a gossip topic.
    pub cluster_name: String,
    /// Hex encoded 32 byte topic, overrides `cluster_name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    pub bootstrap_peers: Vec<String>,
    /// Hex encoded node secret key, a fresh one is generated when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    pub max_message_size: usize,
    /// Seconds between full state pushes.
    pub push_pull_interval: u64,
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            cluster_name: "default".into(),
            topic_id: None,
            bootstrap_peers: Vec::new(),
            secret_key: None,
            max_message_size: 64 * 1024,
            push_pull_interval: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Http {
    pub listen: SocketAddr,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9000)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tasks {
    /// Replicate jobs without probing anything.
    pub dry_run: bool,
    /// Directory receiving one file SD file per job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states: Option<PathBuf>,
    /// Seconds between two pings of a target.
    pub interval: u64,
    /// Seconds to wait for an echo reply.
    pub timeout: u64,
    /// Seconds to wait after a failed probe round.
    pub backoff: u64,
    pub ttl: u32,
}

impl Default for Tasks {
    fn default() -> Self {
        Self {
            dry_run: false,
            states: None,
            interval: 1,
            timeout: 3,
            backoff: 5,
            // default value from `net.ipv4.ip_default_ttl`
            ttl: 64,
        }
    }
}

impl Tasks {
    pub fn options(&self) -> TaskOptions {
        TaskOptions {
            interval: Duration::from_secs(self.interval),
            timeout: Duration::from_secs(self.timeout),
            backoff: Duration::from_secs(self.backoff),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("gossiping.toml"))
            .merge(Json::file("gossiping.json"))
            .merge(Env::prefixed("GOSSIPING_").split("__"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        figment::Jail::expect_with(|_jail| {
            let config: Config = Config::figment().extract()?;
            assert_eq!(config.http.listen, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
            assert_eq!(config.cluster.cluster_name, "default");
            assert!(!config.tasks.dry_run);
            assert_eq!(config.tasks.options().backoff, Duration::from_secs(5));
            Ok(())
        });
    }

    #[test]
    fn file_and_env_layers() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "gossiping.toml",
                r#"
                [global.external_labels]
                region = "eu-west"

                [cluster]
                bootstrap_peers = ["abc"]

                [tasks]
                interval = 10
                "#,
            )?;
            jail.set_env("GOSSIPING_TASKS__DRY_RUN", "true");
            jail.set_env("GOSSIPING_HTTP__LISTEN", "127.0.0.1:9100");

            let config: Config = Config::figment().extract()?;
            assert_eq!(
                config.global.external_labels.get("region").map(String::as_str),
                Some("eu-west")
            );
            assert_eq!(config.cluster.bootstrap_peers, vec!["abc".to_string()]);
            assert_eq!(config.tasks.interval, 10);
            assert!(config.tasks.dry_run);
            assert_eq!(config.http.listen, "127.0.0.1:9100".parse::<SocketAddr>().unwrap());
            Ok(())
        });
    }
}
