use dotenv::dotenv;
use std::env;
use std::str::FromStr;
use uuid::Uuid;

const NODE_ROLE: &str = "NODE_ROLE";
const DISCOVERY_URL: &str = "DISCOVERY_URL";
const SERVICE_NAME: &str = "SERVICE_NAME";
const NODE_PORT: &str = "NODE_PORT";
const CLIENT_ID: &str = "CLIENT_ID";

/// Role a node plays in the swarm: servers serve inbound requests and announce
/// themselves, clients pull state from whichever server the discovery layer finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Server,
    Client,
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(NodeRole::Server),
            "client" => Ok(NodeRole::Client),
            other => Err(format!("unknown node role: {other}")),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub role: NodeRole,
    pub discovery_url: String,
    pub service_name: String,
    pub port: u16,
    pub client_id: String,
}

impl Config {
    pub fn from_env() -> Config {
        match Self::try_from_env() {
            Ok(config) => config,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn try_from_env() -> Result<Config, String> {
        // Load .env file
        dotenv().ok();

        let discovery_url = env::var(DISCOVERY_URL)
            .map_err(|_| format!("failed to load environment variable {}", DISCOVERY_URL))?;

        let role = env::var(NODE_ROLE)
            .map_err(|_| format!("failed to load environment variable {}", NODE_ROLE))?
            .parse::<NodeRole>()?;

        let port = match env::var(NODE_PORT) {
            Ok(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("failed to parse {}: {}", NODE_PORT, raw))?,
            Err(_) => 1337,
        };

        let service_name =
            env::var(SERVICE_NAME).unwrap_or_else(|_| "p2p_orderbook".to_string());

        let client_id =
            env::var(CLIENT_ID).unwrap_or_else(|_| Uuid::new_v4().to_string());

        Ok(Config {
            role,
            discovery_url,
            service_name,
            port,
            client_id,
        })
    }

    pub fn default() -> Config {
        Config {
            role: NodeRole::Client,
            discovery_url: "http://127.0.0.1:30001".to_string(),
            service_name: "p2p_orderbook".to_string(),
            port: 1337,
            client_id: Uuid::new_v4().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("server".parse::<NodeRole>(), Ok(NodeRole::Server));
        assert_eq!("Client".parse::<NodeRole>(), Ok(NodeRole::Client));
        assert!("observer".parse::<NodeRole>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.role, NodeRole::Client);
        assert_eq!(config.port, 1337);
        assert!(!config.client_id.is_empty());
    }
}
