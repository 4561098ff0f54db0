// Kiro to Anthropic converter
//
// This module converts Kiro API responses to Anthropic Messages API format.
// Handles both streaming and non-streaming responses.

#![allow(dead_code)]

use uuid::Uuid;

use crate::models::anthropic::{AnthropicMessagesResponse, AnthropicUsage, ContentBlock};
use crate::models::kiro::KiroResponse;

/// Generates a unique message ID in Anthropic format.
fn generate_message_id() -> String {
    format!("msg_{}", &Uuid::new_v4().simple().to_string()[..24])
}

/// Converts Kiro response to Anthropic MessagesResponse.
///
/// This handles the non-streaming case where we have a complete response.
pub fn convert_kiro_to_anthropic_response(
    kiro_response: &KiroResponse,
    model: &str,
) -> AnthropicMessagesResponse {
    let message_id = generate_message_id();

    // Build content blocks
    let mut content_blocks = Vec::new();

    // Add text content from assistant response message
    for block in &kiro_response.assistant_response_message.content {
        match block {
            crate::models::kiro::ContentBlock::Text { text } => {
                if !text.is_empty() {
                    content_blocks.push(ContentBlock::Text { text: text.clone() });
                }
            }
        }
    }

    // Add tool use blocks if present
    if let Some(tool_uses) = &kiro_response.assistant_response_message.tool_uses {
        for tool_use in tool_uses {
            content_blocks.push(ContentBlock::ToolUse {
                id: tool_use.tool_use_id.clone(),
                name: tool_use.name.clone(),
                input: tool_use.input.clone(),
            });
        }
    }

    // Determine stop_reason
    let stop_reason = if kiro_response.assistant_response_message.tool_uses.is_some() {
        Some("tool_use".to_string())
    } else {
        Some("end_turn".to_string())
    };

    // Calculate usage
    let usage = if let Some(kiro_usage) = &kiro_response.usage {
        AnthropicUsage {
            input_tokens: kiro_usage.input_tokens,
            output_tokens: kiro_usage.output_tokens,
        }
    } else {
        AnthropicUsage {
            input_tokens: 0,
            output_tokens: 0,
        }
    };

    // Create response
    AnthropicMessagesResponse {
        id: message_id,
        response_type: "message".to_string(),
        model: model.to_string(),
        role: "assistant".to_string(),
        content: content_blocks,
        stop_reason,
        stop_sequence: None,
        usage,
    }
}
