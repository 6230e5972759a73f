pub mod types;

pub use types::{
    ChatMessage, ConversationTurn, MessageRole, SideChannelKind, StreamEvent, ToolCall,
    ToolInvocation, ToolResult,
};
