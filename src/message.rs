use serde::{Deserialize, Serialize};

/// A message in a conversation, containing a role and text content.
///
/// Messages carry the conversation history threaded through a workflow
/// invocation and form the transcript handed to text generation.
///
/// # Examples
///
/// ```
/// use shopgraph::message::Message;
///
/// let user_msg = Message::user("Do you have wireless headphones under $100?");
/// let assistant_msg = Message::assistant("We have several options in that range.");
/// let system_msg = Message::system("You are a helpful shop assistant.");
///
/// assert!(user_msg.has_role(Message::USER));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender (e.g., "user", "assistant", "system").
    ///
    /// Use the constants on [`Message`] for standardized values.
    pub role: String,
    /// The text content of the message.
    pub content: String,
}

impl Message {
    /// User input message role.
    pub const USER: &'static str = "user";
    /// AI assistant response message role.
    pub const ASSISTANT: &'static str = "assistant";
    /// System prompt or instruction message role.
    pub const SYSTEM: &'static str = "system";

    /// Creates a new message with the specified role and content.
    #[must_use]
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    /// Creates a user message with the specified content.
    #[must_use]
    pub fn user(content: &str) -> Self {
        Self::new(Self::USER, content)
    }

    /// Creates an assistant message with the specified content.
    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self::new(Self::ASSISTANT, content)
    }

    /// Creates a system message with the specified content.
    #[must_use]
    pub fn system(content: &str) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    /// Returns true if this message has the specified role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convenience_constructors() {
        let user_msg = Message::user("Hello");
        assert_eq!(user_msg.role, Message::USER);
        assert_eq!(user_msg.content, "Hello");

        let assistant_msg = Message::assistant("Hi there!");
        assert_eq!(assistant_msg.role, Message::ASSISTANT);

        let system_msg = Message::system("You are helpful");
        assert_eq!(system_msg.role, Message::SYSTEM);

        let custom_msg = Message::new("tool", "Result: 42");
        assert_eq!(custom_msg.role, "tool");
        assert_eq!(custom_msg.content, "Result: 42");
    }

    #[test]
    fn test_role_checking() {
        let user_msg = Message::user("Hello");
        assert!(user_msg.has_role(Message::USER));
        assert!(!user_msg.has_role(Message::ASSISTANT));
        assert!(!user_msg.has_role(Message::SYSTEM));
    }

    #[test]
    fn test_serialization() {
        let original = Message::user("Test message");
        let json = serde_json::to_string(&original).expect("serialization failed");
        let deserialized: Message = serde_json::from_str(&json).expect("deserialization failed");

        assert_eq!(original, deserialized);
        assert_eq!(deserialized.role, "user");
    }
}
