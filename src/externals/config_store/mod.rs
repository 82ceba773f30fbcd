use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::{config::AppConfig, models::user_config::UserConfig};

/// Supplies per-user settings. Read once when a user logs in.
pub trait ConfigStore: Send + Sync {
    /// Settings for `username`, or the default settings for an unknown user.
    fn load_user_config(&self, username: &str) -> UserConfig;

    fn save_user_config(&self, username: &str, config: UserConfig);
}

/// Config store seeded from the `[users]` table of the application config.
#[derive(Default)]
pub struct InMemoryConfigStore {
    users: RwLock<HashMap<String, UserConfig>>,
}

impl InMemoryConfigStore {
    pub fn new(users: HashMap<String, UserConfig>) -> Self {
        Self {
            users: RwLock::new(users),
        }
    }
}

impl From<&AppConfig> for InMemoryConfigStore {
    fn from(config: &AppConfig) -> Self {
        Self::new(config.users.clone())
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn load_user_config(&self, username: &str) -> UserConfig {
        match self.users.read().get(username) {
            Some(config) => config.clone(),
            None => {
                debug!("No config for user '{}'. Using defaults.", username);
                UserConfig::default()
            }
        }
    }

    fn save_user_config(&self, username: &str, config: UserConfig) {
        info!("Saving config for user '{}'.", username);
        self.users.write().insert(username.to_owned(), config);
    }
}
