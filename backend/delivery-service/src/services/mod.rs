pub mod message_router;
pub mod notification_dispatcher;
pub mod request_service;
pub mod request_state;

pub use message_router::{ChatSummary, MessageRouter, RouteReport};
pub use notification_dispatcher::NotificationDispatcher;
pub use request_service::{InviteOutcome, InviteResult, ProposalOutcome, RequestService};
pub use request_state::{RequestEvent, RequestState, TransitionError};
