// Thinking block parser for streaming responses
//
// Implements a finite state machine (FSM) for reliable parsing of thinking blocks
// (<thinking>, <think>, <reasoning>, etc.) that may be split across multiple
// network chunks.
//
// Key features:
// - Tag detection ONLY at the start of response
// - "Cautious" sending - buffers potential tag fragments to avoid splitting tags
// - After closing tag - all content is treated as regular content
// - Support for multiple tag formats

/// Parser states
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParserState {
    /// Initial state, buffering to detect opening tag
    PreContent,
    /// Inside thinking block, buffering until closing tag
    InThinking,
    /// Regular streaming, no more thinking block detection
    Streaming,
}

/// Result of processing a content chunk through the parser
#[derive(Debug, Default)]
pub struct ThinkingParseResult {
    /// Content to be sent as reasoning_content
    pub thinking_content: Option<String>,
    /// Regular content to be sent as delta.content
    pub regular_content: Option<String>,
    /// True if this is the first chunk of thinking content
    pub is_first_thinking_chunk: bool,
    /// True if thinking block just closed
    pub is_last_thinking_chunk: bool,
    /// True if parser state changed during this feed
    pub state_changed: bool,
}

/// Finite state machine parser for thinking blocks in streaming responses
pub struct ThinkingParser {
    /// How to handle thinking blocks
    pub handling_mode: String,
    /// List of opening tags to detect
    pub open_tags: Vec<String>,
    /// Max chars to buffer while looking for opening tag
    pub initial_buffer_size: usize,
    /// Max tag length for cautious buffering
    pub max_tag_length: usize,
    
    /// Current state
    pub state: ParserState,
    /// Buffer for initial content (looking for opening tag)
    pub initial_buffer: String,
    /// Buffer for thinking content
    pub thinking_buffer: String,
    /// Detected opening tag
    pub open_tag: Option<String>,
    /// Corresponding closing tag
    pub close_tag: Option<String>,
    /// Whether this is the first thinking chunk
    pub is_first_thinking_chunk: bool,
    /// Whether a thinking block was found
    pub thinking_block_found: bool,
}

impl ThinkingParser {
    /// Create a new thinking parser with default settings
    pub fn new() -> Self {
        let open_tags = vec![
            "<thinking>".to_string(),
            "<think>".to_string(),
            "<reasoning>".to_string(),
            "<thought>".to_string(),
        ];
        let max_tag_length = open_tags.iter().map(|t| t.len()).max().unwrap_or(10) * 2;
        
        Self {
            handling_mode: "as_reasoning_content".to_string(),
            open_tags,
            initial_buffer_size: 20,
            max_tag_length,
            state: ParserState::PreContent,
            initial_buffer: String::new(),
            thinking_buffer: String::new(),
            open_tag: None,
            close_tag: None,
            is_first_thinking_chunk: true,
            thinking_block_found: false,
        }
    }
    
    /// Create a new thinking parser with custom settings
    #[allow(dead_code)]
    pub fn with_config(handling_mode: &str, initial_buffer_size: usize) -> Self {
        let mut parser = Self::new();
        parser.handling_mode = handling_mode.to_string();
        parser.initial_buffer_size = initial_buffer_size;
        parser
    }
    
    /// Process a chunk of content through the parser
    pub fn feed(&mut self, content: &str) -> ThinkingParseResult {
        let mut result = ThinkingParseResult::default();
        
        if content.is_empty() {
            return result;
        }
        
        // Handle based on current state
        match self.state {
            ParserState::PreContent => {
                result = self.handle_pre_content(content);
                
                // If state changed to InThinking, content is already in thinking_buffer
                if self.state == ParserState::InThinking && result.state_changed {
                    // Process thinking buffer for potential closing tag
                    let thinking_result = self.process_thinking_buffer();
                    if thinking_result.thinking_content.is_some() {
                        result.thinking_content = thinking_result.thinking_content;
                        result.is_first_thinking_chunk = thinking_result.is_first_thinking_chunk;
                    }
                    if thinking_result.is_last_thinking_chunk {
                        result.is_last_thinking_chunk = true;
                    }
                    if thinking_result.regular_content.is_some() {
                        result.regular_content = thinking_result.regular_content;
                    }
                }
            }
            ParserState::InThinking => {
                result = self.handle_in_thinking(content);
            }
            ParserState::Streaming => {
                result.regular_content = Some(content.to_string());
            }
        }
        
        result
    }
    
    /// Handle content in PreContent state
    fn handle_pre_content(&mut self, content: &str) -> ThinkingParseResult {
        let mut result = ThinkingParseResult::default();
        self.initial_buffer.push_str(content);
        
        // Strip leading whitespace for tag detection
        let stripped = self.initial_buffer.trim_start();
        
        // Check if buffer starts with any of the opening tags
        for tag in &self.open_tags.clone() {
            if stripped.starts_with(tag) {
                // Tag found! Transition to InThinking
                self.state = ParserState::InThinking;
                self.open_tag = Some(tag.clone());
                self.close_tag = Some(format!("</{}", &tag[1..]));
                self.thinking_block_found = true;
                result.state_changed = true;
                
                // Content after the tag goes to thinking buffer
                let content_after_tag = &stripped[tag.len()..];
                self.thinking_buffer = content_after_tag.to_string();
                self.initial_buffer.clear();
                
                return result;
            }
        }
        
        // Check if we might still be receiving the tag
        for tag in &self.open_tags {
            if tag.starts_with(stripped) && stripped.len() < tag.len() {
                // Could still be receiving the tag, keep buffering
                return result;
            }
        }
        
        // No tag found and buffer is either too long or doesn't match any tag prefix
        if self.initial_buffer.len() > self.initial_buffer_size || !self.could_be_tag_prefix(stripped) {
            // No thinking block, transition to Streaming
            self.state = ParserState::Streaming;
            result.state_changed = true;
            result.regular_content = Some(self.initial_buffer.clone());
            self.initial_buffer.clear();
        }
        
        result
    }
    
    /// Check if text could be the start of any opening tag
    fn could_be_tag_prefix(&self, text: &str) -> bool {
        if text.is_empty() {
            return true;
        }
        
        for tag in &self.open_tags {
            if tag.starts_with(text) {
                return true;
            }
        }
        false
    }
    
    /// Handle content in InThinking state
    fn handle_in_thinking(&mut self, content: &str) -> ThinkingParseResult {
        self.thinking_buffer.push_str(content);
        self.process_thinking_buffer()
    }
    
    /// Process the thinking buffer, looking for closing tag
    fn process_thinking_buffer(&mut self) -> ThinkingParseResult {
        let mut result = ThinkingParseResult::default();
        
        let Some(close_tag) = &self.close_tag.clone() else {
            return result;
        };
        
        // Check for closing tag
        if let Some(idx) = self.thinking_buffer.find(close_tag) {
            // Found closing tag!
            let thinking_content = self.thinking_buffer[..idx].to_string();
            let after_tag = self.thinking_buffer[idx + close_tag.len()..].to_string();
            
            // Send all thinking content
            if !thinking_content.is_empty() {
                result.thinking_content = Some(thinking_content);
                result.is_first_thinking_chunk = self.is_first_thinking_chunk;
                self.is_first_thinking_chunk = false;
            }
            
            result.is_last_thinking_chunk = true;
            
            // Transition to Streaming
            self.state = ParserState::Streaming;
            result.state_changed = true;
            self.thinking_buffer.clear();
            
            // Content after closing tag is regular content
            // Strip leading whitespace/newlines that often follow the closing tag
            let stripped_after = after_tag.trim_start();
            if !stripped_after.is_empty() {
                result.regular_content = Some(stripped_after.to_string());
            }
            
            return result;
        }
        
        // No closing tag yet - use "cautious" sending
        // Keep last max_tag_length chars in buffer to avoid splitting tag
        if self.thinking_buffer.len() > self.max_tag_length {
            let split_point = self.thinking_buffer.len() - self.max_tag_length;
            // Find a valid UTF-8 character boundary at or before split_point
            let safe_split = self.thinking_buffer
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|&i| i <= split_point)
                .last()
                .unwrap_or(0);

            if safe_split > 0 {
                let send_part = self.thinking_buffer[..safe_split].to_string();
                self.thinking_buffer = self.thinking_buffer[safe_split..].to_string();

                result.thinking_content = Some(send_part);
                result.is_first_thinking_chunk = self.is_first_thinking_chunk;
                self.is_first_thinking_chunk = false;
            }
        }
        
        result
    }
    
    /// Finalize parsing when stream ends
    #[allow(dead_code)]
    pub fn finalize(&mut self) -> ThinkingParseResult {
        let mut result = ThinkingParseResult::default();
        
        // Flush thinking buffer if we're still in thinking state
        if !self.thinking_buffer.is_empty() {
            if self.state == ParserState::InThinking {
                result.thinking_content = Some(self.thinking_buffer.clone());
                result.is_first_thinking_chunk = self.is_first_thinking_chunk;
                result.is_last_thinking_chunk = true;
            } else {
                result.regular_content = Some(self.thinking_buffer.clone());
            }
            self.thinking_buffer.clear();
        }
        
        // Flush initial buffer if we never found a tag
        if !self.initial_buffer.is_empty() {
            let existing = result.regular_content.unwrap_or_default();
            result.regular_content = Some(existing + &self.initial_buffer);
            self.initial_buffer.clear();
        }
        
        result
    }
    
    /// Reset parser to initial state
    #[allow(dead_code)]
    pub fn reset(&mut self) {
        self.state = ParserState::PreContent;
        self.initial_buffer.clear();
        self.thinking_buffer.clear();
        self.open_tag = None;
        self.close_tag = None;
        self.is_first_thinking_chunk = true;
        self.thinking_block_found = false;
    }
    
    /// Process thinking content according to handling mode
    pub fn process_for_output(&self, thinking_content: &str, is_first: bool, is_last: bool) -> Option<String> {
        if thinking_content.is_empty() {
            return None;
        }
        
        match self.handling_mode.as_str() {
            "remove" => None,
            "pass" => {
                // Add tags back
                let prefix = if is_first { self.open_tag.as_deref().unwrap_or("") } else { "" };
                let suffix = if is_last { self.close_tag.as_deref().unwrap_or("") } else { "" };
                Some(format!("{}{}{}", prefix, thinking_content, suffix))
            }
            "strip_tags" => Some(thinking_content.to_string()),
            _ => Some(thinking_content.to_string()), // "as_reasoning_content" - return as-is
        }
    }
}

impl Default for ThinkingParser {
    fn default() -> Self {
        Self::new()
    }
}
