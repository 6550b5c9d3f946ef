use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default UDP port of the DHT
pub const DEFAULT_DHT_PORT: u16 = 6250;

/// Configuration for the DHT engine
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// UDP listen address
    pub listen_addr: SocketAddr,
    /// TCP port advertised in connection requests
    pub tcp_port: u16,
    /// Nick announced in INF
    pub nick: String,
    /// The number of nodes to keep in each bucket
    pub k_value: usize,
    /// The number of nodes to query in parallel during lookups
    pub alpha_value: usize,
    /// Highest node type returned by closest-node queries
    pub max_node_type: u8,
    /// Idle time after which a node is marked offline and probed
    pub node_liveness_timeout: Duration,
    /// Idle time after which a node is evicted
    pub node_removal_timeout: Duration,
    /// How long to wait for a probe answer
    pub node_response_timeout: Duration,
    /// `is_connected` recency window
    pub connected_timeout: Duration,
    /// Per-query deadline inside a lookup round
    pub search_query_timeout: Duration,
    /// Lifetime of node and store lookups
    pub search_node_lifetime: Duration,
    /// Lifetime of file lookups
    pub search_file_lifetime: Duration,
    /// Number of answers needed to classify reachability
    pub fw_responses: usize,
    /// Time to wait for reachability answers
    pub fw_check_window: Duration,
    /// Lifetime of PUB provider hints
    pub provider_ttl: Duration,
    /// Maximum nodes sent in a node list
    pub max_node_list: usize,
    /// Flood-guard accounting window
    pub flood_window: Duration,
    /// Expiration sweep period
    pub expiration_interval: Duration,
    /// Persistence sweep period
    pub save_interval: Duration,
    /// Search driver period
    pub search_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_DHT_PORT),
            tcp_port: 0,
            nick: "adc-dht".to_string(),
            k_value: 10,
            alpha_value: 3,
            max_node_type: 2,
            node_liveness_timeout: Duration::from_secs(2 * 60 * 60), // 2 hours
            node_removal_timeout: Duration::from_secs(3 * 60 * 60),  // 3 hours
            node_response_timeout: Duration::from_secs(2 * 60),
            connected_timeout: Duration::from_secs(10 * 60),
            search_query_timeout: Duration::from_secs(3),
            search_node_lifetime: Duration::from_secs(20),
            search_file_lifetime: Duration::from_secs(45),
            fw_responses: 3,
            fw_check_window: Duration::from_secs(5 * 60),
            provider_ttl: Duration::from_secs(2 * 60 * 60),
            max_node_list: 50,
            flood_window: Duration::from_secs(60),
            expiration_interval: Duration::from_secs(60),
            save_interval: Duration::from_secs(5 * 60),
            search_interval: Duration::from_secs(1),
        }
    }
}
