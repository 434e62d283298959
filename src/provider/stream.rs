use serde::Deserialize;
use serde_json::Value;

/// One newline-delimited event emitted by the worker in stream-json mode.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        #[serde(default)]
        message: AssistantMessage,
    },
    User {
        #[serde(default)]
        message: Option<Value>,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    Event(StreamEvent),
    /// A line that is not a JSON event; treated as plain output text.
    Raw(String),
}

/// Parses one stdout line. Blank lines yield `None`; raw lines keep their
/// indentation and lose only a trailing carriage return.
pub fn parse_line(line: &str) -> Option<StreamLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<StreamEvent>(trimmed) {
        Ok(event) => Some(StreamLine::Event(event)),
        Err(_) => Some(StreamLine::Raw(line.trim_end_matches('\r').to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_and_result_events_carry_session_id() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc","tools":[]}"#;
        assert_eq!(
            parse_line(line),
            Some(StreamLine::Event(StreamEvent::System {
                subtype: Some("init".to_string()),
                session_id: Some("abc".to_string()),
            }))
        );

        let line = r#"{"type":"result","subtype":"success","result":"done","session_id":"abc","is_error":false,"cost_usd":0.1}"#;
        match parse_line(line) {
            Some(StreamLine::Event(StreamEvent::Result {
                result, session_id, ..
            })) => {
                assert_eq!(result.as_deref(), Some("done"));
                assert_eq!(session_id.as_deref(), Some("abc"));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn assistant_content_splits_text_and_tool_use() {
        let line = json!({
            "type": "assistant",
            "message": {
                "id": "msg_1",
                "content": [
                    {"type": "text", "text": "Looking."},
                    {"type": "tool_use", "id": "tu_1", "name": "Read", "input": {"file_path": "/a.rs"}},
                    {"type": "thinking", "thinking": "hmm"}
                ]
            }
        })
        .to_string();

        let Some(StreamLine::Event(StreamEvent::Assistant { message })) = parse_line(&line) else {
            panic!("expected assistant event");
        };
        assert_eq!(
            message.content,
            vec![
                ContentBlock::Text {
                    text: "Looking.".to_string()
                },
                ContentBlock::ToolUse {
                    name: "Read".to_string(),
                    input: json!({"file_path": "/a.rs"}),
                },
                ContentBlock::Other,
            ]
        );
    }

    #[test]
    fn unknown_types_and_malformed_lines_are_tolerated() {
        assert_eq!(
            parse_line(r#"{"type":"stream_event","event":{}}"#),
            Some(StreamLine::Event(StreamEvent::Unknown))
        );
        assert_eq!(
            parse_line("plain output"),
            Some(StreamLine::Raw("plain output".to_string()))
        );
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn raw_lines_keep_their_indentation() {
        assert_eq!(
            parse_line("    println!(\"hi\");\r"),
            Some(StreamLine::Raw("    println!(\"hi\");".to_string()))
        );
        assert_eq!(
            parse_line("| a |  b |"),
            Some(StreamLine::Raw("| a |  b |".to_string()))
        );
    }
}
