//! Server file loading.
//!
//! The server file is JSON with `//` and `/* */` comments allowed:
//!
//! ```jsonc
//! {
//!   "servers": [
//!     // A local server
//!     { "name": "files", "transport": { "type": "stdio", "command": "mcp-files" } },
//!     {
//!       "name": "notion",
//!       "transport": {
//!         "type": "http",
//!         "url": "https://mcp.notion.com/mcp",
//!         "headers": { "X-Workspace": "{env:NOTION_WORKSPACE}" }
//!       },
//!       "oauth": { "type": "dynamic" }
//!     }
//!   ]
//! }
//! ```
//!
//! `{env:VAR_NAME}` is replaced with the environment variable before parsing.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use toolgate_mcp::ServerConfig;

static VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

fn var_regex() -> &'static regex::Regex {
    VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\{env:([^}]+)\}")
            .expect("Invalid regex pattern - this is a compile-time constant")
    })
}

/// Contents of a server file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerFile {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// `<config dir>/toolgate/servers.json`.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("toolgate")
        .join("servers.json")
}

impl ServerFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid server file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let stripped = strip_comments(content);
        let substituted = substitute_env(&stripped)?;
        let file: ServerFile = serde_json::from_str(&substituted)?;

        for server in &file.servers {
            server
                .validate()
                .with_context(|| format!("Server {:?}", server.name))?;
        }
        Ok(file)
    }
}

/// Strip `//` and `/* */` comments outside of strings.
fn strip_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }

        if in_string {
            match c {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            result.push(c);
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                result.push(c);
            }
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    // Keep line numbers stable for parse errors.
                    if c == '\n' {
                        result.push('\n');
                    }
                    prev = c;
                }
            }
            _ => result.push(c),
        }
    }

    result
}

fn substitute_env(content: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = var_regex().replace_all(content, |caps: &regex::Captures<'_>| {
        match std::env::var(&caps[1]) {
            Ok(value) => escape_json(&value),
            Err(_) => {
                missing.push(caps[1].to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        bail!("Environment variable not set: {}", missing.join(", "));
    }
    Ok(result.into_owned())
}

/// Values land inside JSON strings.
fn escape_json(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}
