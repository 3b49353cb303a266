pub mod messages;
pub mod registry;
pub mod session;

pub use messages::{NotificationInbound, ServerEvent};
pub use registry::{Channel, Connection, ConnectionId, ConnectionRegistry, Delivery, Outbound};
pub use session::WsSession;
