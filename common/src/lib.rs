pub mod config;
pub mod led;
pub mod lifecycle;
pub mod oauth;
pub mod presence;
pub mod store;
pub mod transport;
pub mod types;

pub use config::{DeviceConfig, LedConfig};
pub use led::{LedChannel, LedLevel, LedWrite, Pattern};
pub use lifecycle::{Now, Supervisor};
pub use oauth::{AuthStartError, DeviceCodeSession, OauthTokens};
pub use store::{KeyValueStore, MemStore, StoreError};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, TransportError};
pub use types::{DeviceState, Presence, StatusPayload};
