use crate::api::sse::split_reasoning;
use crate::types::Citation;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Streaming)
    }
}

/// Accumulator for one assistant answer while it is being delivered.
///
/// `raw` keeps every content chunk as received; visible content and the
/// reasoning text are always recomputed from it.
#[derive(Debug)]
pub struct StreamingSession {
    conversation_id: String,
    message_id: String,
    raw: String,
    explicit_thinking: Vec<String>,
    citations: Vec<Citation>,
    content: String,
    thinking: String,
    state: SessionState,
}

impl StreamingSession {
    pub fn new(conversation_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            raw: String::new(),
            explicit_thinking: Vec::new(),
            citations: Vec::new(),
            content: String::new(),
            thinking: String::new(),
            state: SessionState::Streaming,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Appends a chunk; returns whether the visible content changed.
    pub fn push_content(&mut self, chunk: &str) -> bool {
        if self.state.is_terminal() || chunk.is_empty() {
            return false;
        }
        self.raw.push_str(chunk);
        self.recompute(false)
    }

    pub fn push_thinking(&mut self, piece: &str) {
        if self.state.is_terminal() || piece.trim().is_empty() {
            return;
        }
        self.explicit_thinking.push(piece.trim().to_string());
        self.recompute(false);
    }

    pub fn set_citations(&mut self, citations: Vec<Citation>) {
        if !self.state.is_terminal() {
            self.citations = citations;
        }
    }

    /// Flushes held-back text and marks the answer complete.
    pub fn complete(&mut self) {
        self.finish(SessionState::Completed);
    }

    pub fn fail(&mut self) {
        self.finish(SessionState::Failed);
    }

    pub fn cancel(&mut self) {
        self.finish(SessionState::Cancelled);
    }

    fn finish(&mut self, state: SessionState) {
        if self.state.is_terminal() {
            return;
        }
        self.recompute(true);
        self.state = state;
    }

    fn recompute(&mut self, finished: bool) -> bool {
        let (visible, extracted) = split_reasoning(&self.raw, finished);
        let mut thinking = self.explicit_thinking.join("\n");
        if !extracted.is_empty() {
            if !thinking.is_empty() {
                thinking.push('\n');
            }
            thinking.push_str(&extracted);
        }
        self.thinking = thinking;

        // Visible text only ever grows; a shorter recomputation keeps the old value.
        if visible.len() > self.content.len() && visible.starts_with(self.content.as_str()) {
            self.content = visible;
            true
        } else {
            false
        }
    }
}
