pub mod attributes;
pub mod classifier;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod logging;
pub mod message;
pub mod prober;
pub mod relay;
pub mod server;

pub use attributes::{Attribute, ChangeRequest};
pub use classifier::{discover, Classification, NatClassifier, NatType};
pub use config::{ClientConfig, ServerConfig};
pub use endpoint::{EndpointSet, Role};
pub use handler::{target_index, BindingHandler};
pub use message::{Class, Method, StunMessage, TransactionId};
pub use prober::{CancelToken, Prober, UdpProber};
pub use relay::{RelayClient, RelayEnvelope, RELAY_PATH};
pub use server::{ServerHandle, StunServer};
