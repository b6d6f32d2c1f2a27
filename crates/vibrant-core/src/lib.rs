pub mod command;
pub mod errors;
pub mod ids;

pub use command::{
    AgentReply, CommandKind, CommandPayload, CommandResult, EvalOutcome, OutboundEnvelope,
    PasteOutcome, ScreenshotOutcome,
};
pub use errors::{BrokerError, ClientIdError, ReplyError};
pub use ids::{ClientId, ConnectionId, RequestId};
