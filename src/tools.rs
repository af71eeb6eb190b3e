//! Tool call dispatch: schema for the speech session and routing of call
//! batches to the local volume controller and the network executors.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::volume::{VolumeAction, VolumeController};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error("{0} unavailable")]
    Unavailable(String),
}

/// One function call requested by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Result of one call: `response` is `{"result": ..}`, `{"level": ..}` or `{"error": ".."}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub response: Value,
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        self.response.get("error").is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// Natural-language home automation commands.
pub trait HomeAutomation: Send + Sync {
    fn execute_home_command(&self, command: &str) -> Result<String, ToolError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MusicAction {
    /// Search and play; `None` resumes playback.
    Play { query: Option<String> },
    Next,
    Previous,
}

pub trait MusicService: Send + Sync {
    fn execute_music_command(&self, action: MusicAction) -> Result<String, ToolError>;
}

pub struct ToolDispatcher {
    volume: Arc<VolumeController>,
    home: Option<Arc<dyn HomeAutomation>>,
    music: Option<Arc<dyn MusicService>>,
}

impl ToolDispatcher {
    pub fn new(
        volume: Arc<VolumeController>,
        home: Option<Arc<dyn HomeAutomation>>,
        music: Option<Arc<dyn MusicService>>,
    ) -> Self {
        Self { volume, home, music }
    }

    /// Tools offered to the session. Executors that are not configured are not advertised.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut tools = vec![ToolDeclaration {
            name: "adjust_volume",
            description: "Adjust the volume of the voice assistant. Use this to make it louder, quieter, or set a specific volume level.",
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "action": {
                        "type": "STRING",
                        "enum": ["increase", "decrease", "set"],
                        "description": "The action to perform: 'increase' (louder), 'decrease' (quieter), or 'set'."
                    },
                    "level": {
                        "type": "INTEGER",
                        "description": "The target volume percentage (0-100). Required only if action is 'set'."
                    }
                },
                "required": ["action"]
            }),
        }];

        if self.home.is_some() {
            tools.push(ToolDeclaration {
                name: "control_smart_device",
                description: "Control smart home devices by sending a natural language command.",
                parameters: json!({
                    "type": "OBJECT",
                    "properties": {
                        "command": {
                            "type": "STRING",
                            "description": "The full natural language command to execute (e.g., 'turn on the kitchen light')."
                        }
                    },
                    "required": ["command"]
                }),
            });
        }

        if self.music.is_some() {
            tools.push(ToolDeclaration {
                name: "play_music",
                description: "Play music. Can play specific songs, albums, playlists or resume playback.",
                parameters: json!({
                    "type": "OBJECT",
                    "properties": {
                        "query": {
                            "type": "STRING",
                            "description": "The song, album, or artist to play. If empty, resumes playback."
                        }
                    }
                }),
            });
            tools.push(ToolDeclaration {
                name: "next_track",
                description: "Skip to the next song.",
                parameters: json!({"type": "OBJECT", "properties": {}}),
            });
            tools.push(ToolDeclaration {
                name: "previous_track",
                description: "Go back to the previous song.",
                parameters: json!({"type": "OBJECT", "properties": {}}),
            });
        }
        tools
    }

    /// Run a batch. Always yields one result per call, in call order.
    pub async fn dispatch(&self, calls: Vec<ToolCall>) -> Vec<ToolResult> {
        join_all(calls.into_iter().map(|call| self.dispatch_one(call))).await
    }

    async fn dispatch_one(&self, call: ToolCall) -> ToolResult {
        info!(tool = %call.name, id = %call.id, args = %call.args, "tool_call");
        let outcome = self.execute(&call).await;
        let response = match outcome {
            Ok(value) => value,
            Err(e) => {
                error!(tool = %call.name, id = %call.id, error = %e, "tool execution error");
                json!({ "error": e.to_string() })
            }
        };
        ToolResult {
            id: call.id,
            name: call.name,
            response,
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<Value, ToolError> {
        match call.name.as_str() {
            "adjust_volume" => {
                let action = VolumeAction::from_args(&call.args)?;
                Ok(self.volume.adjust(action))
            }
            "control_smart_device" => {
                let home = self
                    .home
                    .clone()
                    .ok_or_else(|| ToolError::Unavailable("home automation".into()))?;
                let command = call
                    .args
                    .get("command")
                    .and_then(Value::as_str)
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| ToolError::BadArguments("missing 'command'".into()))?
                    .to_string();
                let speech = off_thread(move || home.execute_home_command(&command)).await?;
                Ok(json!({ "result": speech }))
            }
            "play_music" | "next_track" | "previous_track" => {
                let music = self
                    .music
                    .clone()
                    .ok_or_else(|| ToolError::Unavailable("music service".into()))?;
                let action = match call.name.as_str() {
                    "play_music" => MusicAction::Play {
                        query: call
                            .args
                            .get("query")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .filter(|q| !q.is_empty())
                            .map(String::from),
                    },
                    "next_track" => MusicAction::Next,
                    _ => MusicAction::Previous,
                };
                let message = off_thread(move || music.execute_music_command(action)).await?;
                Ok(json!({ "result": message }))
            }
            other => {
                warn!(tool = %other, "unknown tool requested");
                Err(ToolError::Unknown(other.to_string()))
            }
        }
    }
}

/// Run a blocking executor on the blocking pool so network I/O never stalls
/// the session scheduler.
async fn off_thread<F>(f: F) -> Result<String, ToolError>
where
    F: FnOnce() -> Result<String, ToolError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ToolError::Failed(format!("executor panicked: {e}")))?
}
