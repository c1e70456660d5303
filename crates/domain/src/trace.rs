use serde::Serialize;

/// Structured trace events emitted across all threadmind crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    LlmRequest {
        request_id: String,
        provider: String,
        model: String,
        streaming: bool,
        duration_ms: u64,
        outcome: String,
    },
    ToolInvoked {
        request_id: String,
        tool: String,
        success: bool,
        duration_ms: u64,
    },
    TitleGenerated {
        root_post_id: String,
        title_chars: usize,
    },
    BotsReloaded {
        active: usize,
        skipped: usize,
        deactivated: usize,
    },
    McpClientConnected {
        user_id: String,
        server_id: String,
        tools: usize,
    },
    McpClientReaped {
        user_id: String,
        server_id: String,
        idle_secs: u64,
    },
    StreamFinished {
        post_id: String,
        outcome: String,
        chars: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "tm_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_serialization() {
        let ev = TraceEvent::ToolInvoked {
            request_id: "r".into(),
            tool: "lookup_user".into(),
            success: true,
            duration_ms: 3,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "ToolInvoked");
        assert_eq!(v["tool"], "lookup_user");
    }
}
