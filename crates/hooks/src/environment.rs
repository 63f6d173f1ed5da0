use crate::types::{HookContext, HookTrigger};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest value placed in a single variable. The kernel rejects a spawn
/// whose single argument or variable exceeds 128 KiB; the full context still
/// reaches command hooks on stdin.
pub const MAX_ENV_VALUE_BYTES: usize = 32 * 1024;

/// Environment variables exposed to a hook process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HookEnvironment {
    vars: BTreeMap<String, String>,
}

impl HookEnvironment {
    pub fn capture(trigger: HookTrigger, ctx: &HookContext) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("KEEL_TRIGGER".to_string(), trigger.as_str().to_string());
        vars.insert("KEEL_SESSION_ID".to_string(), ctx.session_id.clone());
        vars.insert("KEEL_CWD".to_string(), ctx.cwd.to_string_lossy().to_string());

        let mut set = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                vars.insert(key.to_string(), cap_value(value));
            }
        };
        set("KEEL_TOOL_NAME", ctx.tool_name.clone());
        set("KEEL_TOOL_PARAMS", ctx.tool_params.as_ref().map(|p| p.to_string()));
        set("KEEL_TOOL_OUTPUT", ctx.tool_output.clone());
        set("KEEL_USER_MESSAGE", ctx.user_message.clone());
        set("KEEL_AGENT_RESPONSE", ctx.agent_response.clone());
        set("KEEL_ERROR", ctx.error.clone());

        Self { vars }
    }

    /// Layer user-configured variables on top. Reserved `KEEL_*` names win.
    pub fn with_extra<'a>(mut self, extra: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        for (key, value) in extra {
            if !key.starts_with("KEEL_") {
                self.vars.insert(key.clone(), value.clone());
            }
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn to_concise_string(&self) -> String {
        self.vars
            .iter()
            .filter(|(k, _)| k.starts_with("KEEL_"))
            .map(|(k, v)| {
                let first = v.lines().next().unwrap_or("");
                format!("{}={}", k, first)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn cap_value(value: String) -> String {
    if value.len() <= MAX_ENV_VALUE_BYTES {
        return value;
    }
    let mut end = MAX_ENV_VALUE_BYTES;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated, {} bytes total]", &value[..end], value.len())
}
