#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_peers: usize,
    pub max_rooms: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_peers: 64,
            max_rooms: 16,
        }
    }
}
