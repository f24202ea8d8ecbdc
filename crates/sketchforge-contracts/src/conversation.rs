#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub prompt: String,
    pub response: String,
}

/// Ordered turn history of one enhancement conversation.
///
/// Owned by exactly one enhancer for one pipeline invocation. Not `Clone`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fresh(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn push(&mut self, prompt: impl Into<String>, response: impl Into<String>) {
        self.turns.push(Turn {
            prompt: prompt.into(),
            response: response.into(),
        });
    }
}
