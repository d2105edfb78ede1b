pub mod api;
pub mod error;
pub mod messages;
pub mod resource;
pub mod support;
pub mod wire;

pub use api::{ApiKind, ParamDesc, ParamKind};
pub use error::ProtocolError;
pub use messages::{Message, MigrationPayload, PROTOCOL_VERSION};
pub use resource::ResourceTypeId;
