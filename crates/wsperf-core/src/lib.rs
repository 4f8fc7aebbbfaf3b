//! Shared types for the wsperf commander: identifiers, test case
//! definitions, the worker wire protocol and the events relayed to observers.

pub mod case;
pub mod command;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod worker;

pub use case::CaseDefinition;
pub use command::TestCommand;
pub use errors::ProtocolError;
pub use events::BrokerEvent;
pub use ids::{ConnectionId, RunId, WorkerId};
pub use messages::WorkerMessage;
pub use worker::WorkerRecord;
