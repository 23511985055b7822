//! Conversational-AI export importer.
//!
//! Parses provider JSON exports (Claude, ChatGPT, Gemini) into canonical
//! conversations, then renders them as plain text so the rest of the
//! pipeline treats an archive like any other document: chunked, entity-
//! extracted, embedded. Provider detection is by shape, not filename.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A provider-neutral conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub provider: &'static str,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub timestamp: Option<i64>,
}

/// Import summary recorded in the audit log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImportSummary {
    pub provider: &'static str,
    pub conversation_count: usize,
    pub message_count: usize,
    pub date_range_start: Option<i64>,
    pub date_range_end: Option<i64>,
}

/// Parse an export file's JSON into canonical conversations, detecting the
/// provider from the data shape.
pub fn parse_export(data: &Value) -> Result<(Vec<Conversation>, ImportSummary)> {
    let conversations = if detect_claude(data) {
        parse_claude(data)
    } else if detect_chatgpt(data) {
        parse_chatgpt(data)
    } else if detect_gemini(data) {
        parse_gemini(data)
    } else {
        bail!("Unrecognized conversation export format")
    };

    let provider = conversations
        .first()
        .map(|c| c.provider)
        .unwrap_or("unknown");
    let message_count = conversations.iter().map(|c| c.messages.len()).sum();
    let date_range_start = conversations.iter().filter_map(|c| c.created_at).min();
    let date_range_end = conversations.iter().filter_map(|c| c.updated_at).max();

    let summary = ImportSummary {
        provider,
        conversation_count: conversations.len(),
        message_count,
        date_range_start,
        date_range_end,
    };

    Ok((conversations, summary))
}

/// Render conversations to the text fed into chunking. Each conversation
/// becomes a titled section with role-tagged lines.
pub fn render_text(conversations: &[Conversation]) -> String {
    let mut out = String::new();
    for conv in conversations {
        out.push_str("## ");
        out.push_str(&conv.title);
        out.push('\n');
        for msg in &conv.messages {
            out.push('[');
            out.push_str(&msg.role);
            out.push_str("] ");
            out.push_str(&msg.content);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

/// A filename that looks like an AI-conversation export (watcher trigger).
pub fn looks_like_export(file_name: &str) -> bool {
    let name = file_name.to_lowercase();
    name == "conversations.json"
        || (name.ends_with(".json") && (name.contains("export") || name.contains("chat")))
}

// ============ Claude ============

fn detect_claude(data: &Value) -> bool {
    let Some(list) = data.as_array() else {
        return false;
    };
    let Some(first) = list.first().and_then(|v| v.as_object()) else {
        return false;
    };
    ["uuid", "name", "created_at", "chat_messages"]
        .iter()
        .all(|k| first.contains_key(*k))
}

fn parse_claude(data: &Value) -> Vec<Conversation> {
    let mut conversations = Vec::new();

    for conv in data.as_array().into_iter().flatten() {
        let mut messages = Vec::new();
        for msg in conv["chat_messages"].as_array().into_iter().flatten() {
            let mut content = msg["text"].as_str().unwrap_or("").to_string();
            if content.is_empty() {
                // Newer exports carry a typed content list.
                if let Some(parts) = msg["content"].as_array() {
                    content = parts
                        .iter()
                        .filter(|p| p["type"].as_str() == Some("text"))
                        .filter_map(|p| p["text"].as_str())
                        .collect::<Vec<_>>()
                        .join(" ");
                }
            }
            messages.push(Message {
                role: if msg["sender"].as_str() == Some("human") {
                    "human".to_string()
                } else {
                    "assistant".to_string()
                },
                content,
                timestamp: parse_iso(msg["created_at"].as_str()),
            });
        }

        conversations.push(Conversation {
            id: conv["uuid"].as_str().unwrap_or("").to_string(),
            title: conv["name"].as_str().unwrap_or("Untitled").to_string(),
            provider: "claude",
            created_at: parse_iso(conv["created_at"].as_str()),
            updated_at: parse_iso(conv["updated_at"].as_str()),
            messages,
        });
    }

    conversations
}

// ============ ChatGPT ============

fn detect_chatgpt(data: &Value) -> bool {
    let Some(list) = data.as_array() else {
        return false;
    };
    let Some(first) = list.first().and_then(|v| v.as_object()) else {
        return false;
    };
    first.contains_key("mapping") && first.contains_key("title")
}

fn parse_chatgpt(data: &Value) -> Vec<Conversation> {
    let mut conversations = Vec::new();

    for conv in data.as_array().into_iter().flatten() {
        let mut messages = Vec::new();

        if let Some(mapping) = conv["mapping"].as_object() {
            for node in mapping.values() {
                let msg = &node["message"];
                if msg.is_null() {
                    continue;
                }
                let role = msg["author"]["role"].as_str().unwrap_or("unknown");
                if !matches!(role, "user" | "assistant" | "system") {
                    continue;
                }
                let content = msg["content"]["parts"]
                    .as_array()
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p.as_str())
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default();
                if content.trim().is_empty() {
                    continue;
                }
                messages.push(Message {
                    role: if role == "user" {
                        "human".to_string()
                    } else {
                        role.to_string()
                    },
                    content,
                    timestamp: msg["create_time"].as_f64().map(|t| t as i64),
                });
            }
        }

        // The mapping is a tree keyed by node id; restore chronology.
        messages.sort_by_key(|m| m.timestamp.unwrap_or(0));

        conversations.push(Conversation {
            id: conv["id"].as_str().unwrap_or("").to_string(),
            title: conv["title"].as_str().unwrap_or("Untitled").to_string(),
            provider: "chatgpt",
            created_at: conv["create_time"].as_f64().map(|t| t as i64),
            updated_at: conv["update_time"].as_f64().map(|t| t as i64),
            messages,
        });
    }

    conversations
}

// ============ Gemini ============

fn detect_gemini(data: &Value) -> bool {
    data.get("conversations")
        .and_then(|c| c.as_array())
        .and_then(|list| list.first())
        .map(|first| first.get("messages").is_some())
        .unwrap_or(false)
}

fn parse_gemini(data: &Value) -> Vec<Conversation> {
    let mut conversations = Vec::new();

    for conv in data["conversations"].as_array().into_iter().flatten() {
        let messages = conv["messages"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|msg| {
                let content = msg["text"].as_str()?.to_string();
                Some(Message {
                    role: match msg["author"].as_str() {
                        Some("user") => "human".to_string(),
                        Some(other) => other.to_string(),
                        None => "assistant".to_string(),
                    },
                    content,
                    timestamp: parse_iso(msg["create_time"].as_str()),
                })
            })
            .collect();

        conversations.push(Conversation {
            id: conv["conversation_id"].as_str().unwrap_or("").to_string(),
            title: conv["title"].as_str().unwrap_or("Untitled").to_string(),
            provider: "gemini",
            created_at: parse_iso(conv["create_time"].as_str()),
            updated_at: parse_iso(conv["update_time"].as_str()),
            messages,
        });
    }

    conversations
}

fn parse_iso(value: Option<&str>) -> Option<i64> {
    let value = value?;
    DateTime::parse_from_rfc3339(&value.replace('Z', "+00:00"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detect_and_parse_claude() {
        let data = json!([{
            "uuid": "c1",
            "name": "Planning chat",
            "created_at": "2024-01-05T10:00:00Z",
            "updated_at": "2024-01-05T11:00:00Z",
            "chat_messages": [
                {"uuid": "m1", "sender": "human", "text": "Draft the plan with Alice", "created_at": "2024-01-05T10:00:00Z"},
                {"uuid": "m2", "sender": "assistant", "text": "Here is the plan.", "created_at": "2024-01-05T10:01:00Z"}
            ]
        }]);

        let (conversations, summary) = parse_export(&data).unwrap();
        assert_eq!(summary.provider, "claude");
        assert_eq!(summary.conversation_count, 1);
        assert_eq!(summary.message_count, 2);
        assert_eq!(conversations[0].messages[0].role, "human");
    }

    #[test]
    fn test_claude_typed_content_list() {
        let data = json!([{
            "uuid": "c1",
            "name": "Typed",
            "created_at": "2024-01-05T10:00:00Z",
            "chat_messages": [
                {"uuid": "m1", "sender": "human", "text": "",
                 "content": [{"type": "text", "text": "part one"}, {"type": "text", "text": "part two"}]}
            ]
        }]);
        let (conversations, _) = parse_export(&data).unwrap();
        assert_eq!(conversations[0].messages[0].content, "part one part two");
    }

    #[test]
    fn test_detect_and_parse_chatgpt() {
        let data = json!([{
            "id": "g1",
            "title": "Debugging",
            "create_time": 1704448800.0,
            "update_time": 1704452400.0,
            "mapping": {
                "n2": {"message": {"id": "m2", "author": {"role": "assistant"},
                        "content": {"parts": ["Try a bisect."]}, "create_time": 1704448860.0}},
                "n1": {"message": {"id": "m1", "author": {"role": "user"},
                        "content": {"parts": ["Tests are flaky."]}, "create_time": 1704448800.0}},
                "root": {"message": null}
            }
        }]);

        let (conversations, summary) = parse_export(&data).unwrap();
        assert_eq!(summary.provider, "chatgpt");
        let msgs = &conversations[0].messages;
        assert_eq!(msgs.len(), 2);
        // Chronological despite map ordering.
        assert_eq!(msgs[0].content, "Tests are flaky.");
        assert_eq!(msgs[0].role, "human");
    }

    #[test]
    fn test_detect_and_parse_gemini() {
        let data = json!({
            "conversations": [{
                "conversation_id": "x1",
                "title": "Notes",
                "create_time": "2024-02-01T08:00:00Z",
                "messages": [
                    {"author": "user", "text": "Summarize the doc", "create_time": "2024-02-01T08:00:00Z"}
                ]
            }]
        });

        let (conversations, summary) = parse_export(&data).unwrap();
        assert_eq!(summary.provider, "gemini");
        assert_eq!(conversations[0].messages[0].role, "human");
    }

    #[test]
    fn test_unknown_format_rejected() {
        let data = json!({"something": "else"});
        assert!(parse_export(&data).is_err());
    }

    #[test]
    fn test_render_text() {
        let conversations = vec![Conversation {
            id: "c1".to_string(),
            title: "Planning".to_string(),
            provider: "claude",
            created_at: None,
            updated_at: None,
            messages: vec![Message {
                role: "human".to_string(),
                content: "Hello".to_string(),
                timestamp: None,
            }],
        }];
        let text = render_text(&conversations);
        assert!(text.contains("## Planning"));
        assert!(text.contains("[human] Hello"));
    }

    #[test]
    fn test_export_filename_trigger() {
        assert!(looks_like_export("conversations.json"));
        assert!(looks_like_export("claude-export-2024.json"));
        assert!(looks_like_export("my_chat_history.json"));
        assert!(!looks_like_export("settings.json"));
        assert!(!looks_like_export("export.csv"));
    }
}
