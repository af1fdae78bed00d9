mod session;
mod store;
mod turn;

pub use session::{ChatSession, SessionSettings};
pub use store::{ConversationStore, HttpConversationStore, SavedConversation};
pub use turn::{Conversation, Turn, TurnMetrics, TurnRole};
